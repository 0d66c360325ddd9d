// tests/test_pipe.rs
//
// The duplex pipe between a producer thread and a consumer, plus its
// pass-through mode over pull sources.

use bytes::Bytes;
use omnistore::pipe::{copy, read_to_end, Chunks, IterSource, WriterSink};
use omnistore::{ByteSource, DuplexPipe, ReaderSource, StorageError};
use std::io::Read;
use std::thread;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

#[test]
fn test_producer_consumer_preserves_bytes() {
    let data = pattern(1_000_003);
    let pipe = DuplexPipe::with_capacity(4);

    let producer = {
        let pipe = pipe.clone();
        let data = Bytes::from(data.clone());
        thread::spawn(move || {
            for chunk in data.chunks(7_919) {
                pipe.write(Bytes::copy_from_slice(chunk)).unwrap();
            }
            pipe.close();
        })
    };

    let mut out = Vec::new();
    loop {
        let piece = pipe.read(Some(65_536)).unwrap();
        if piece.is_empty() {
            break;
        }
        assert!(piece.len() <= 65_536);
        out.extend_from_slice(&piece);
    }
    producer.join().unwrap();
    assert_eq!(out, data);

    // exhaustion is terminal
    assert!(pipe.read(None).unwrap().is_empty());
}

#[test]
fn test_reader_drives_std_io() {
    let data = pattern(300_000);
    let pipe = DuplexPipe::new();
    let producer = {
        let pipe = pipe.clone();
        let data = data.clone();
        thread::spawn(move || {
            for chunk in data.chunks(10_000) {
                pipe.write(Bytes::copy_from_slice(chunk)).unwrap();
            }
            pipe.close();
        })
    };

    let mut reader = pipe.reader();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    producer.join().unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_abandoned_consumer_releases_producer() {
    let pipe = DuplexPipe::with_capacity(1);
    let producer = {
        let pipe = pipe.clone();
        thread::spawn(move || {
            let mut result = Ok(());
            for _ in 0..100 {
                result = pipe.write(Bytes::from_static(b"0123456789"));
                if result.is_err() {
                    break;
                }
            }
            result
        })
    };

    let reader = pipe.reader();
    assert_eq!(&reader.read(Some(4)).unwrap()[..], b"0123");
    drop(reader);
    assert!(producer.join().unwrap().is_err());
}

#[test]
fn test_producer_failure_reaches_consumer() {
    let mut pipe = DuplexPipe::new();
    let producer = {
        let pipe = pipe.clone();
        thread::spawn(move || {
            pipe.write(Bytes::from_static(b"partial")).unwrap();
            pipe.fail(StorageError::Transfer("upstream reset".into()));
        })
    };
    producer.join().unwrap();

    assert_eq!(pipe.next_chunk().unwrap().as_deref(), Some(&b"partial"[..]));
    match pipe.next_chunk() {
        Err(StorageError::Transfer(msg)) => assert!(msg.contains("upstream reset")),
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn test_passthrough_over_pull_source() {
    let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cde")), Ok(Bytes::from_static(b"f"))];
    let pipe = DuplexPipe::from_source(Box::new(IterSource::new(chunks.into_iter())));
    assert_eq!(&pipe.read(Some(4)).unwrap()[..], b"abcd");
    assert_eq!(&pipe.read(None).unwrap()[..], b"ef");
    assert!(pipe.read(Some(1)).unwrap().is_empty());
    assert!(pipe.is_closed());
    assert!(matches!(pipe.write(Bytes::from_static(b"x")), Err(StorageError::Usage(_))));
}

#[test]
fn test_copy_and_chunks() {
    let data = pattern(10_000);
    let mut source = ReaderSource::with_chunk_size(std::io::Cursor::new(data.clone()), 4096).unwrap();
    let mut sink = WriterSink::new(Vec::new());
    assert_eq!(copy(&mut source, &mut sink).unwrap(), 10_000);
    assert_eq!(sink.into_inner(), data);

    source.rewind().unwrap();
    let sizes: Vec<usize> = Chunks::new(Box::new(source)).map(|c| c.unwrap().len()).collect();
    assert_eq!(sizes, vec![4096, 4096, 1808]);

    let mut again = ReaderSource::from_bytes(data.clone());
    assert_eq!(read_to_end(&mut again).unwrap(), Bytes::from(data));
}
