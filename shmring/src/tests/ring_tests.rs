use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use crate::errors::RingError;
use crate::reader::{MessageReader, ReaderConfig};
use crate::writer::{MessageWriter, WriterConfig};

use super::support::unique_ring;

/// Uniquely tagged payload with a content pattern derived from the tag,
/// so a reassembly mistake shows up as an inconsistent body.
#[derive(Debug, Clone, PartialEq)]
struct TaggedMessage {
    id: u64,
    body: Vec<u8>,
}

impl TaggedMessage {
    fn new(id: u64, body_len: usize) -> TaggedMessage {
        let fill = (id % 251) as u8;
        TaggedMessage {
            id,
            body: vec![fill; body_len],
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.body.len());
        bytes.extend_from_slice(&self.id.to_le_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<TaggedMessage> {
        if bytes.len() < 8 {
            return None;
        }
        let id = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        Some(TaggedMessage {
            id,
            body: bytes[8..].to_vec(),
        })
    }

    fn is_consistent(&self) -> bool {
        let fill = (self.id % 251) as u8;
        self.body.iter().all(|&b| b == fill)
    }
}

#[test]
fn round_trip_preserves_payload() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(8, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    // empty, sub-block, exact single block, multi-block, exact multi-block,
    // and the largest admissible payload of (block_count - 1) blocks
    let lengths = [0usize, 1, 63, 64, 65, 128, 300, 7 * 64];
    for &len in &lengths {
        let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        writer.send(&payload)?;
        let got = reader.receive()?;
        assert_eq!(got, payload, "length {}", len);
    }
    Ok(())
}

#[test]
fn capacity_is_conserved_when_idle() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(8, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    assert_eq!(writer.service().free_blocks()?, 8);
    assert_eq!(writer.service().signaled_blocks()?, 0);

    for round in 0..20 {
        writer.send(&vec![round as u8; 100])?;
        reader.receive()?;
    }

    // every block cycled back to the free pool
    assert_eq!(writer.service().free_blocks()?, 8);
    assert_eq!(writer.service().signaled_blocks()?, 0);
    Ok(())
}

#[test]
fn committed_blocks_move_between_pools() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(8, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    writer.send(&[1u8; 100])?; // two blocks
    assert_eq!(writer.service().free_blocks()?, 6);
    assert_eq!(writer.service().signaled_blocks()?, 2);

    reader.receive()?;
    assert_eq!(writer.service().free_blocks()?, 8);
    assert_eq!(writer.service().signaled_blocks()?, 0);
    Ok(())
}

#[test]
fn receive_times_out_on_empty_ring() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(4, 64);
    let _writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    let err = reader.receive_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, RingError::CapacityTimeout));
    Ok(())
}

#[test]
fn send_times_out_when_ring_is_full() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(4, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    for i in 0..4 {
        writer.send(&[i as u8; 10])?;
    }
    assert_eq!(writer.service().free_blocks()?, 0);

    let err = writer
        .send_timeout(&[9u8; 10], Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, RingError::CapacityTimeout));
    // the timed-out send left no reservation behind
    assert_eq!(writer.service().free_blocks()?, 0);
    assert_eq!(writer.service().signaled_blocks()?, 4);

    // draining one message frees capacity and the send goes through
    assert_eq!(reader.receive_timeout(Duration::from_secs(2))?, [0u8; 10]);
    writer.send_timeout(&[9u8; 10], Duration::from_secs(2))?;
    Ok(())
}

#[test]
fn drains_a_ring_filled_to_capacity() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(4, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    // the commit frontier wraps onto the claim frontier's slot; every
    // message must still come out
    for i in 0..4 {
        writer.send(&[i as u8; 10])?;
    }
    assert_eq!(writer.service().free_blocks()?, 0);
    assert_eq!(writer.service().signaled_blocks()?, 4);

    for i in 0..4u8 {
        let got = reader.receive_timeout(Duration::from_secs(2))?;
        assert_eq!(got, vec![i; 10]);
    }
    assert_eq!(writer.service().free_blocks()?, 4);
    assert_eq!(writer.service().signaled_blocks()?, 0);
    Ok(())
}

#[test]
fn refills_and_drains_across_the_wrap() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(4, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    // two 2-block messages occupy the whole ring each round, so every
    // cursor passes its wrap slot several times
    for round in 0..6u8 {
        let first = vec![round; 100];
        let second = vec![round ^ 0xff; 100];
        writer.send(&first)?;
        writer.send(&second)?;
        assert_eq!(writer.service().free_blocks()?, 0);

        assert_eq!(reader.receive_timeout(Duration::from_secs(2))?, first);
        assert_eq!(reader.receive_timeout(Duration::from_secs(2))?, second);
        assert_eq!(writer.service().free_blocks()?, 4);
        assert_eq!(writer.service().signaled_blocks()?, 0);
    }
    Ok(())
}

#[test]
fn largest_admissible_payload_fits() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(4, 64);
    let mut writer = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg })?;

    let payload = vec![0x5a; 3 * 64];
    writer.send(&payload)?;
    assert_eq!(reader.receive()?, payload);

    assert!(matches!(
        writer.send(&vec![0x5a; 3 * 64 + 1]),
        Err(RingError::OversizedMessage { .. })
    ));
    Ok(())
}

#[test]
fn single_writer_messages_arrive_in_order() -> Result<(), RingError> {
    let (cfg, _dir) = unique_ring(16, 64);
    // Created first so it owns the segment for the whole test; endpoints
    // hold raw pointers into the mapping and are not Send, so the feeder
    // thread attaches on its own.
    let _owner = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg.clone() })?;

    let total = 200u64;
    let feeder = thread::spawn(move || {
        let mut writer = MessageWriter::new(&WriterConfig { ring: cfg }).expect("attach writer");
        for id in 0..total {
            // vary the chain length between one and three blocks
            let msg = TaggedMessage::new(id, (id as usize % 3) * 70);
            writer.send(&msg.to_bytes()).expect("send");
        }
    });

    for expected in 0..total {
        let msg = TaggedMessage::from_bytes(&reader.receive()?).expect("tag header");
        assert_eq!(msg.id, expected);
        assert!(msg.is_consistent());
    }
    feeder.join().unwrap();
    Ok(())
}

#[test]
fn concurrent_writers_deliver_each_message_exactly_once() -> Result<(), RingError> {
    let writers = 4u64;
    let per_writer = 50u64;

    let (cfg, _dir) = unique_ring(16, 64);
    // Created first so it owns the segment for the whole test.
    let _owner = MessageWriter::new(&WriterConfig { ring: cfg.clone() })?;
    let reader = MessageReader::new(&ReaderConfig { ring: cfg.clone() })?;

    let mut handles = Vec::new();
    for w in 0..writers {
        let cfg = cfg.clone();
        handles.push(thread::spawn(move || {
            // each writer attaches on its own, mirroring the process model
            let mut writer =
                MessageWriter::new(&WriterConfig { ring: cfg }).expect("attach writer");
            for i in 0..per_writer {
                let id = w * per_writer + i;
                let msg = TaggedMessage::new(id, (id as usize % 4) * 50);
                writer.send(&msg.to_bytes()).expect("send");
            }
        }));
    }

    let mut seen: HashMap<u64, usize> = HashMap::new();
    for _ in 0..writers * per_writer {
        let msg = TaggedMessage::from_bytes(&reader.receive()?).expect("tag header");
        assert!(msg.is_consistent(), "interleaved chain for id {}", msg.id);
        assert_eq!(
            msg.body.len(),
            (msg.id as usize % 4) * 50,
            "truncated chain for id {}",
            msg.id
        );
        *seen.entry(msg.id).or_insert(0) += 1;
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(seen.len() as u64, writers * per_writer);
    assert!(seen.values().all(|&count| count == 1));
    assert_eq!(reader.service().free_blocks()?, 16);
    Ok(())
}
