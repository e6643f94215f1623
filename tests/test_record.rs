//! Tests for record framing

use fcgi_host::Error;
use fcgi_host::buffer::BufferPools;
use fcgi_host::protocol::{
    HEADER_LEN, Header, MAX_BODY_LEN, RecordReader, RecordType, RecordWriter, padding_for,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[test]
fn test_padding_invariant_for_every_body_length() {
    for len in 0..=MAX_BODY_LEN {
        let padding = padding_for(len) as usize;
        assert_eq!(padding, (8 - len % 8) % 8);
        assert!(padding < 8);
        assert_eq!((HEADER_LEN + len + padding) % 8, 0);

        let header = Header::new(RecordType::StandardOutput, 1, len as u16);
        assert_eq!(header.padding_length as usize, padding);
        assert_eq!(header.frame_len() % 8, 0);
    }
}

#[test]
fn test_header_decode_round_trip() {
    let header = Header::new(RecordType::Params, 513, 1000);
    let decoded = Header::decode(&header.encode()).unwrap();

    assert_eq!(decoded, header);
    assert_eq!(decoded.version, 1);
}

#[test]
fn test_all_record_types_map_to_wire_values() {
    let types = [
        RecordType::BeginRequest,
        RecordType::AbortRequest,
        RecordType::EndRequest,
        RecordType::Params,
        RecordType::StandardInput,
        RecordType::StandardOutput,
        RecordType::StandardError,
        RecordType::Data,
        RecordType::GetValues,
        RecordType::GetValuesResult,
        RecordType::UnknownType,
    ];
    for (i, record_type) in types.into_iter().enumerate() {
        assert_eq!(u8::from(record_type), i as u8 + 1);
        assert_eq!(RecordType::from(i as u8 + 1), record_type);
    }
    assert_eq!(RecordType::from(0), RecordType::Other(0));
}

#[tokio::test]
async fn test_writer_pads_frames_with_zeros() {
    let pools = BufferPools::default();
    let (client, mut server) = tokio::io::duplex(1024);

    let mut writer = RecordWriter::new(client, pools.claim_triple());
    writer.send(RecordType::StandardOutput, 7, b"hello").await.unwrap();
    drop(writer);

    let mut bytes = Vec::new();
    server.read_to_end(&mut bytes).await.unwrap();

    assert_eq!(bytes.len(), 16);
    assert_eq!(&bytes[..8], &[1, 6, 0, 7, 0, 5, 3, 0]);
    assert_eq!(&bytes[8..13], b"hello");
    assert_eq!(&bytes[13..], &[0, 0, 0]);
}

#[tokio::test]
async fn test_writer_rejects_oversized_body() {
    let pools = BufferPools::default();
    let (client, _server) = tokio::io::duplex(1024);

    let mut writer = RecordWriter::new(client, pools.claim_triple());
    let body = vec![0u8; MAX_BODY_LEN + 1];
    let err = writer.send(RecordType::StandardOutput, 1, &body).await.unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_reader_reads_consecutive_records() {
    let pools = BufferPools::new(16);
    let (client, server) = tokio::io::duplex(1 << 20);

    let mut writer = RecordWriter::new(client, pools.claim_triple());
    let large = vec![0xAB; 40_000];
    writer.send(RecordType::Params, 1, b"abc").await.unwrap();
    writer.send(RecordType::StandardInput, 1, &large).await.unwrap();
    writer.send(RecordType::StandardInput, 1, &[]).await.unwrap();
    drop(writer);

    let mut reader = RecordReader::new(server, pools.claim_triple());

    let record = reader.receive().await.unwrap().unwrap();
    assert_eq!(record.record_type(), RecordType::Params);
    assert_eq!(record.body, b"abc");

    let record = reader.receive().await.unwrap().unwrap();
    assert_eq!(record.record_type(), RecordType::StandardInput);
    assert_eq!(record.body.len(), 40_000);
    assert!(record.body.iter().all(|&b| b == 0xAB));

    let record = reader.receive().await.unwrap().unwrap();
    assert!(record.is_empty());

    assert!(reader.receive().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reader_keeps_unknown_type() {
    let pools = BufferPools::default();
    let (mut client, server) = tokio::io::duplex(1024);

    client.write_all(&[1, 99, 0, 0, 0, 0, 0, 0]).await.unwrap();
    drop(client);

    let mut reader = RecordReader::new(server, pools.claim_triple());
    let record = reader.receive().await.unwrap().unwrap();
    assert_eq!(record.record_type(), RecordType::Other(99));
    assert_eq!(record.request_id(), 0);
}

#[tokio::test]
async fn test_reader_honours_foreign_padding() {
    let pools = BufferPools::default();
    let (mut client, server) = tokio::io::duplex(1024);

    // body of 2 bytes followed by 10 padding bytes, then a second record
    let mut bytes = vec![1, 5, 0, 1, 0, 2, 10, 0, b'o', b'k'];
    bytes.extend_from_slice(&[0xEE; 10]);
    bytes.extend_from_slice(&[1, 5, 0, 1, 0, 0, 0, 0]);
    client.write_all(&bytes).await.unwrap();
    drop(client);

    let mut reader = RecordReader::new(server, pools.claim_triple());
    assert_eq!(reader.receive().await.unwrap().unwrap().body, b"ok");
    assert!(reader.receive().await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn test_truncated_header_is_an_error() {
    let pools = BufferPools::default();
    let (mut client, server) = tokio::io::duplex(1024);

    client.write_all(&[1, 4, 0]).await.unwrap();
    drop(client);

    let mut reader = RecordReader::new(server, pools.claim_triple());
    assert!(matches!(reader.receive().await, Err(Error::Truncated)));
}

#[tokio::test]
async fn test_truncated_body_is_an_error() {
    let pools = BufferPools::default();
    let (mut client, server) = tokio::io::duplex(1024);

    client.write_all(&[1, 4, 0, 1, 0, 16, 0, 0, b'x']).await.unwrap();
    drop(client);

    let mut reader = RecordReader::new(server, pools.claim_triple());
    assert!(matches!(reader.receive().await, Err(Error::Truncated)));
}
