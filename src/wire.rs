use crate::error::{FlowError, Result};
use crc32fast::Hasher;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;

/// Serializes packets into the Site-to-Site wire framing.
///
/// Frame layout per packet, all integers big-endian: `u32` attribute count,
/// then for each attribute `u32` key length, key bytes, `u32` value length,
/// value bytes; then `u64` payload length and the payload bytes.
///
/// A running CRC32 covers every byte written since creation, measured before
/// compression. Attributes are written in sorted key order so the same
/// packet always produces the same bytes.
pub struct PacketWriter {
    sink: FrameSink,
    crc: Hasher,
    poisoned: bool,
}

enum FrameSink {
    Plain(Vec<u8>),
    Deflate(DeflateEncoder<Vec<u8>>),
}

impl PacketWriter {
    pub fn new(use_compression: bool) -> Self {
        let sink = if use_compression {
            FrameSink::Deflate(DeflateEncoder::new(Vec::new(), Compression::default()))
        } else {
            FrameSink::Plain(Vec::new())
        };

        Self {
            sink,
            crc: Hasher::new(),
            poisoned: false,
        }
    }

    /// Append one packet frame. After an IO error the writer is unusable and
    /// every further write fails.
    pub fn write_packet(
        &mut self,
        attributes: &HashMap<String, String>,
        payload: &[u8],
    ) -> Result<()> {
        if self.poisoned {
            return Err(FlowError::Transport(
                "packet writer aborted by earlier write failure".to_string(),
            ));
        }

        let mut frame = Vec::new();
        frame.extend_from_slice(&(attributes.len() as u32).to_be_bytes());

        let mut keys: Vec<&String> = attributes.keys().collect();
        keys.sort();
        for key in keys {
            let value = &attributes[key];
            frame.extend_from_slice(&(key.len() as u32).to_be_bytes());
            frame.extend_from_slice(key.as_bytes());
            frame.extend_from_slice(&(value.len() as u32).to_be_bytes());
            frame.extend_from_slice(value.as_bytes());
        }
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());

        self.crc.update(&frame);
        self.crc.update(payload);

        if let Err(e) = self.write_raw(&frame).and_then(|_| self.write_raw(payload)) {
            self.poisoned = true;
            return Err(FlowError::Io(e));
        }

        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match &mut self.sink {
            FrameSink::Plain(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
            FrameSink::Deflate(encoder) => encoder.write_all(bytes),
        }
    }

    /// Drain the output bytes emitted so far. With compression enabled this
    /// returns whatever the encoder has flushed to its buffer; the remainder
    /// arrives from `finish`.
    pub fn take_output(&mut self) -> Vec<u8> {
        match &mut self.sink {
            FrameSink::Plain(buffer) => std::mem::take(buffer),
            FrameSink::Deflate(encoder) => std::mem::take(encoder.get_mut()),
        }
    }

    /// Close the writer, returning any remaining output bytes and the final
    /// CRC32 over all uncompressed bytes.
    pub fn finish(self) -> Result<(Vec<u8>, u64)> {
        let tail = match self.sink {
            FrameSink::Plain(buffer) => buffer,
            FrameSink::Deflate(encoder) => encoder.finish()?,
        };
        Ok((tail, u64::from(self.crc.finalize())))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    /// Reference decoder used by tests and the mock cluster.
    pub(crate) fn decode_packets(mut data: &[u8]) -> Vec<(HashMap<String, String>, Vec<u8>)> {
        fn take<'a>(data: &mut &'a [u8], n: usize) -> &'a [u8] {
            let (head, rest) = data.split_at(n);
            *data = rest;
            head
        }

        fn take_u32(data: &mut &[u8]) -> u32 {
            u32::from_be_bytes(take(data, 4).try_into().unwrap())
        }

        let mut packets = Vec::new();
        while !data.is_empty() {
            let attr_count = take_u32(&mut data);
            let mut attributes = HashMap::new();
            for _ in 0..attr_count {
                let key_len = take_u32(&mut data) as usize;
                let key = String::from_utf8(take(&mut data, key_len).to_vec()).unwrap();
                let value_len = take_u32(&mut data) as usize;
                let value = String::from_utf8(take(&mut data, value_len).to_vec()).unwrap();
                attributes.insert(key, value);
            }
            let payload_len = u64::from_be_bytes(take(&mut data, 8).try_into().unwrap()) as usize;
            let payload = take(&mut data, payload_len).to_vec();
            packets.push((attributes, payload));
        }
        packets
    }

    pub(crate) fn inflate(data: &[u8]) -> Vec<u8> {
        let mut decoder = DeflateDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    fn single_attribute(key: &str, value: &str) -> HashMap<String, String> {
        let mut attributes = HashMap::new();
        attributes.insert(key.to_string(), value.to_string());
        attributes
    }

    #[test]
    fn test_frame_layout_exact_bytes() {
        let mut writer = PacketWriter::new(false);
        writer
            .write_packet(&single_attribute("id", "testId"), b"testPayload")
            .unwrap();
        let (output, _) = writer.finish().unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&2u32.to_be_bytes());
        expected.extend_from_slice(b"id");
        expected.extend_from_slice(&6u32.to_be_bytes());
        expected.extend_from_slice(b"testId");
        expected.extend_from_slice(&11u64.to_be_bytes());
        expected.extend_from_slice(b"testPayload");

        assert_eq!(output, expected);
    }

    #[test]
    fn test_crc_covers_framing_and_payload() {
        let mut writer = PacketWriter::new(false);
        writer
            .write_packet(&single_attribute("id", "testId"), b"testPayload")
            .unwrap();
        let (output, crc) = writer.finish().unwrap();

        let mut hasher = Hasher::new();
        hasher.update(&output);
        assert_eq!(crc, u64::from(hasher.finalize()));
    }

    #[test]
    fn test_roundtrip_multiple_packets() {
        let mut writer = PacketWriter::new(false);
        for i in 0..5 {
            let attributes = single_attribute("id", &format!("testId{}", i));
            writer
                .write_packet(&attributes, format!("testPayload{}", i).as_bytes())
                .unwrap();
        }
        // Interleave incremental drains with the final flush, as the
        // transaction engine does.
        let mut output = writer.take_output();
        let (tail, _) = writer.finish().unwrap();
        output.extend_from_slice(&tail);

        let packets = decode_packets(&output);
        assert_eq!(packets.len(), 5);
        for (i, (attributes, payload)) in packets.iter().enumerate() {
            assert_eq!(attributes.get("id").unwrap(), &format!("testId{}", i));
            assert_eq!(payload, format!("testPayload{}", i).as_bytes());
        }
    }

    #[test]
    fn test_compressed_output_crc_is_pre_compression() {
        let attributes = single_attribute("id", "testId");

        let mut plain = PacketWriter::new(false);
        plain.write_packet(&attributes, b"testPayload").unwrap();
        let (plain_bytes, plain_crc) = plain.finish().unwrap();

        let mut compressed = PacketWriter::new(true);
        compressed.write_packet(&attributes, b"testPayload").unwrap();
        let mut output = compressed.take_output();
        let (tail, compressed_crc) = compressed.finish().unwrap();
        output.extend_from_slice(&tail);

        assert_eq!(plain_crc, compressed_crc);
        assert_ne!(output, plain_bytes);
        assert_eq!(inflate(&output), plain_bytes);
    }

    #[test]
    fn test_empty_packet_frame() {
        let mut writer = PacketWriter::new(false);
        writer.write_packet(&HashMap::new(), b"").unwrap();
        let (output, _) = writer.finish().unwrap();

        let packets = decode_packets(&output);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].0.is_empty());
        assert!(packets[0].1.is_empty());
    }
}
