//! Kafka wire codec for session requests
//!
//! Frames produced here exclude the 4-byte length prefix; the transport adds
//! and strips it. Request headers are the classic v0 header:
//! `api_key i16 | api_version i16 | correlation_id i32 | client_id string`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{ErrorCode, SessionError};
use crate::protocol::*;
use crate::Result;

/// Encodes typed requests and decodes typed responses
pub trait Codec: Send + Sync + fmt::Debug {
    /// Encode a request frame with the given correlation id and client id
    fn encode(
        &self,
        request: &Request,
        correlation_id: CorrelationId,
        client_id: &str,
    ) -> Result<Bytes>;

    /// Decode a response frame into its correlation id and typed response
    fn decode(&self, api_key: ApiKey, frame: Bytes) -> Result<(CorrelationId, Response)>;
}

/// Kafka wire codec using the request versions of [`ApiKey::api_version`]
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaCodec;

impl Codec for KafkaCodec {
    fn encode(
        &self,
        request: &Request,
        correlation_id: CorrelationId,
        client_id: &str,
    ) -> Result<Bytes> {
        let api_key = request.api_key();
        let mut buf = BytesMut::with_capacity(64);

        buf.put_i16(api_key.as_i16());
        buf.put_i16(api_key.api_version());
        buf.put_i32(correlation_id);
        wire::put_string(&mut buf, client_id)?;

        match request {
            Request::Metadata(req) => encode_metadata(&mut buf, req)?,
            Request::ConsumerMetadata(req) => wire::put_string(&mut buf, &req.group)?,
            Request::Fetch(req) => encode_fetch(&mut buf, req)?,
            Request::OffsetFetch(req) => encode_offset_fetch(&mut buf, req)?,
            Request::OffsetCommit(req) => encode_offset_commit(&mut buf, req)?,
            Request::JoinGroup(req) => encode_join_group(&mut buf, req)?,
            Request::SyncGroup(req) => encode_sync_group(&mut buf, req)?,
            Request::Heartbeat(req) => {
                wire::put_string(&mut buf, &req.group)?;
                buf.put_i32(req.generation_id);
                wire::put_string(&mut buf, &req.member_id)?;
            }
            Request::LeaveGroup(req) => {
                wire::put_string(&mut buf, &req.group)?;
                wire::put_string(&mut buf, &req.member_id)?;
            }
        }

        Ok(buf.freeze())
    }

    fn decode(&self, api_key: ApiKey, frame: Bytes) -> Result<(CorrelationId, Response)> {
        let mut reader = wire::Reader::new(frame);
        let correlation_id = reader.get_i32()?;

        let response = match api_key {
            ApiKey::Metadata => Response::Metadata(decode_metadata(&mut reader)?),
            ApiKey::ConsumerMetadata => {
                Response::ConsumerMetadata(decode_consumer_metadata(&mut reader)?)
            }
            ApiKey::Fetch => Response::Fetch(decode_fetch(&mut reader)?),
            ApiKey::OffsetFetch => Response::OffsetFetch(decode_offset_fetch(&mut reader)?),
            ApiKey::OffsetCommit => Response::OffsetCommit(decode_offset_commit(&mut reader)?),
            ApiKey::JoinGroup => Response::JoinGroup(decode_join_group(&mut reader)?),
            ApiKey::SyncGroup => Response::SyncGroup(decode_sync_group(&mut reader)?),
            ApiKey::Heartbeat => Response::Heartbeat(HeartbeatResponse {
                error_code: reader.get_error_code()?,
            }),
            ApiKey::LeaveGroup => Response::LeaveGroup(LeaveGroupResponse {
                error_code: reader.get_error_code()?,
            }),
        };

        Ok((correlation_id, response))
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

fn encode_metadata(buf: &mut BytesMut, req: &MetadataRequest) -> Result<()> {
    wire::put_array_len(buf, req.topics.len())?;
    for topic in &req.topics {
        wire::put_string(buf, topic)?;
    }
    Ok(())
}

fn encode_fetch(buf: &mut BytesMut, req: &FetchRequest) -> Result<()> {
    buf.put_i32(-1); // replica id: ordinary consumer
    buf.put_i32(req.max_wait_ms);
    buf.put_i32(req.min_bytes);
    wire::put_array_len(buf, 1)?;
    wire::put_string(buf, &req.topic)?;
    wire::put_array_len(buf, 1)?;
    buf.put_i32(req.partition);
    buf.put_i64(req.offset);
    buf.put_i32(req.max_bytes);
    Ok(())
}

fn encode_offset_fetch(buf: &mut BytesMut, req: &OffsetFetchRequest) -> Result<()> {
    let group = req
        .group
        .as_deref()
        .ok_or_else(|| SessionError::serialization("Offset fetch request has no group"))?;

    wire::put_string(buf, group)?;
    wire::put_array_len(buf, 1)?;
    wire::put_string(buf, &req.topic)?;
    wire::put_array_len(buf, 1)?;
    buf.put_i32(req.partition);
    Ok(())
}

fn encode_offset_commit(buf: &mut BytesMut, req: &OffsetCommitRequest) -> Result<()> {
    let group = req
        .group
        .as_deref()
        .ok_or_else(|| SessionError::serialization("Offset commit request has no group"))?;

    wire::put_string(buf, group)?;
    buf.put_i32(req.generation_id);
    wire::put_string(buf, &req.member_id)?;
    buf.put_i64(req.retention_time_ms);
    wire::put_array_len(buf, 1)?;
    wire::put_string(buf, &req.topic)?;
    wire::put_array_len(buf, 1)?;
    buf.put_i32(req.partition);
    buf.put_i64(req.offset);
    wire::put_string(buf, &req.metadata)?;
    Ok(())
}

fn encode_join_group(buf: &mut BytesMut, req: &JoinGroupRequest) -> Result<()> {
    wire::put_string(buf, &req.group)?;
    buf.put_i32(req.session_timeout_ms);
    wire::put_string(buf, &req.member_id)?;
    wire::put_string(buf, &req.protocol_type)?;
    wire::put_array_len(buf, req.protocols.len())?;
    for protocol in &req.protocols {
        wire::put_string(buf, &protocol.name)?;
        let subscription = consumer_protocol::encode_subscription(&protocol.topics)?;
        wire::put_bytes(buf, &subscription)?;
    }
    Ok(())
}

fn encode_sync_group(buf: &mut BytesMut, req: &SyncGroupRequest) -> Result<()> {
    wire::put_string(buf, &req.group)?;
    buf.put_i32(req.generation_id);
    wire::put_string(buf, &req.member_id)?;
    wire::put_array_len(buf, req.assignments.len())?;
    for assignment in &req.assignments {
        wire::put_string(buf, &assignment.member_id)?;
        let encoded = consumer_protocol::encode_assignment(&assignment.topics)?;
        wire::put_bytes(buf, &encoded)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

fn decode_metadata(reader: &mut wire::Reader) -> Result<MetadataResponse> {
    let brokers = reader.get_array(|r| {
        Ok(BrokerMetadata {
            node_id: r.get_i32()?,
            host: r.get_string()?,
            port: r.get_i32()?,
        })
    })?;

    let topics = reader.get_array(|r| {
        let error_code = r.get_error_code()?;
        let topic = r.get_string()?;
        let partitions = r.get_array(|p| {
            Ok(PartitionMetadata {
                error_code: p.get_error_code()?,
                partition: p.get_i32()?,
                leader: p.get_i32()?,
                replicas: p.get_array(|x| x.get_i32())?,
                isr: p.get_array(|x| x.get_i32())?,
            })
        })?;
        Ok(TopicMetadata {
            error_code,
            topic,
            partitions,
        })
    })?;

    Ok(MetadataResponse { brokers, topics })
}

fn decode_consumer_metadata(reader: &mut wire::Reader) -> Result<ConsumerMetadataResponse> {
    Ok(ConsumerMetadataResponse {
        error_code: reader.get_error_code()?,
        coordinator_id: reader.get_i32()?,
        host: reader.get_string()?,
        port: reader.get_i32()?,
    })
}

fn decode_fetch(reader: &mut wire::Reader) -> Result<FetchResponse> {
    let topics = reader.get_array(|r| {
        let topic = r.get_string()?;
        let partitions = r.get_array(|p| {
            let partition = p.get_i32()?;
            let error_code = p.get_error_code()?;
            let high_watermark = p.get_i64()?;
            let set_size = p.get_i32()?;
            if set_size < 0 {
                return Err(SessionError::deserialization(format!(
                    "Negative message set size {}",
                    set_size
                )));
            }
            let set = p.take(set_size as usize)?;
            let messages = decode_message_set(set)?;
            let last_offset = messages.last().map(|m| m.offset);

            Ok(FetchPartition {
                partition,
                error_code,
                high_watermark,
                last_offset,
                messages,
            })
        })?;
        Ok(FetchTopic { topic, partitions })
    })?;

    Ok(FetchResponse { topics })
}

/// Entry header size: offset i64 + message size i32
const MESSAGE_ENTRY_HEADER: usize = 12;

/// Compression codec bits of the message attributes
const COMPRESSION_CODEC_MASK: i8 = 0x07;

/// Decode a v0/v1 message set. A truncated trailing message is dropped, as
/// brokers cut sets at `max_bytes`.
fn decode_message_set(set: Bytes) -> Result<Vec<Message>> {
    let mut reader = wire::Reader::new(set);
    let mut messages = Vec::new();

    while reader.remaining() >= MESSAGE_ENTRY_HEADER {
        let offset = reader.get_i64()?;
        let size = reader.get_i32()?;
        if size < 0 {
            return Err(SessionError::deserialization(format!(
                "Negative message size {} at offset {}",
                size, offset
            )));
        }
        if reader.remaining() < size as usize {
            break;
        }

        let mut body = wire::Reader::new(reader.take(size as usize)?);
        let _crc = body.get_i32()?;
        let magic = body.get_i8()?;
        let attributes = body.get_i8()?;
        if attributes & COMPRESSION_CODEC_MASK != 0 {
            return Err(SessionError::deserialization(format!(
                "Compressed message sets are not supported (codec {} at offset {})",
                attributes & COMPRESSION_CODEC_MASK,
                offset
            )));
        }
        let timestamp = if magic >= 1 {
            Some(body.get_i64()?)
        } else {
            None
        };
        let key = body.get_nullable_bytes()?;
        let value = body.get_nullable_bytes()?;

        messages.push(Message {
            offset,
            attributes,
            timestamp,
            key,
            value,
        });
    }

    Ok(messages)
}

fn decode_offset_fetch(reader: &mut wire::Reader) -> Result<OffsetFetchResponse> {
    let topics = reader.get_array(|r| {
        let topic = r.get_string()?;
        let partitions = r.get_array(|p| {
            Ok(OffsetFetchPartition {
                partition: p.get_i32()?,
                offset: p.get_i64()?,
                metadata: p.get_nullable_string()?,
                error_code: p.get_error_code()?,
            })
        })?;
        Ok(OffsetFetchTopic { topic, partitions })
    })?;

    Ok(OffsetFetchResponse { topics })
}

fn decode_offset_commit(reader: &mut wire::Reader) -> Result<OffsetCommitResponse> {
    let topics = reader.get_array(|r| {
        let topic = r.get_string()?;
        let partitions = r.get_array(|p| {
            Ok(OffsetCommitPartition {
                partition: p.get_i32()?,
                error_code: p.get_error_code()?,
            })
        })?;
        Ok(OffsetCommitTopic { topic, partitions })
    })?;

    Ok(OffsetCommitResponse { topics })
}

fn decode_join_group(reader: &mut wire::Reader) -> Result<JoinGroupResponse> {
    let error_code = reader.get_error_code()?;
    let generation_id = reader.get_i32()?;
    let group_protocol = reader.get_string()?;
    let leader_id = reader.get_string()?;
    let member_id = reader.get_string()?;
    let members = reader.get_array(|r| {
        let member_id = r.get_string()?;
        let metadata = r.get_nullable_bytes()?.unwrap_or_default();
        Ok(GroupMember {
            member_id,
            topics: consumer_protocol::decode_subscription(metadata)?,
        })
    })?;

    Ok(JoinGroupResponse {
        error_code,
        generation_id,
        group_protocol,
        leader_id,
        member_id,
        members,
    })
}

fn decode_sync_group(reader: &mut wire::Reader) -> Result<SyncGroupResponse> {
    let error_code = reader.get_error_code()?;
    let assignment = reader.get_nullable_bytes()?.unwrap_or_default();

    Ok(SyncGroupResponse {
        error_code,
        assignments: consumer_protocol::decode_assignment(assignment)?,
    })
}

/// Embedded "consumer" protocol payloads carried as opaque bytes by
/// JoinGroup and SyncGroup
pub mod consumer_protocol {
    use super::wire;
    use crate::protocol::{TopicAssignment, TopicName};
    use crate::Result;
    use bytes::{BufMut, Bytes, BytesMut};

    /// Version of the subscription and assignment payloads
    pub const VERSION: i16 = 0;

    pub fn encode_subscription(topics: &[TopicName]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i16(VERSION);
        wire::put_array_len(&mut buf, topics.len())?;
        for topic in topics {
            wire::put_string(&mut buf, topic)?;
        }
        wire::put_bytes(&mut buf, &[])?; // user data
        Ok(buf.freeze())
    }

    /// An empty payload decodes to no topics
    pub fn decode_subscription(payload: Bytes) -> Result<Vec<TopicName>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let mut reader = wire::Reader::new(payload);
        let _version = reader.get_i16()?;
        reader.get_array(|r| r.get_string())
    }

    pub fn encode_assignment(topics: &[TopicAssignment]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i16(VERSION);
        wire::put_array_len(&mut buf, topics.len())?;
        for assignment in topics {
            wire::put_string(&mut buf, &assignment.topic)?;
            wire::put_array_len(&mut buf, assignment.partitions.len())?;
            for partition in &assignment.partitions {
                buf.put_i32(*partition);
            }
        }
        wire::put_bytes(&mut buf, &[])?;
        Ok(buf.freeze())
    }

    /// An empty payload (member left without partitions) decodes to no topics
    pub fn decode_assignment(payload: Bytes) -> Result<Vec<TopicAssignment>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let mut reader = wire::Reader::new(payload);
        let _version = reader.get_i16()?;
        reader.get_array(|r| {
            let topic = r.get_string()?;
            let partitions = r.get_array(|p| p.get_i32())?;
            Ok(TopicAssignment { topic, partitions })
        })
    }
}

/// Primitive Kafka wire helpers
pub mod wire {
    use super::*;

    pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<()> {
        let len = i16::try_from(s.len())
            .map_err(|_| SessionError::serialization(format!("String too long: {}", s.len())))?;
        buf.put_i16(len);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<()> {
        let len = i32::try_from(bytes.len()).map_err(|_| {
            SessionError::serialization(format!("Byte payload too long: {}", bytes.len()))
        })?;
        buf.put_i32(len);
        buf.put_slice(bytes);
        Ok(())
    }

    pub fn put_array_len(buf: &mut BytesMut, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| SessionError::serialization(format!("Array too long: {}", len)))?;
        buf.put_i32(len);
        Ok(())
    }

    /// Bounds-checked reader over a response frame
    #[derive(Debug)]
    pub struct Reader {
        buf: Bytes,
    }

    impl Reader {
        pub fn new(buf: Bytes) -> Self {
            Self { buf }
        }

        pub fn remaining(&self) -> usize {
            self.buf.remaining()
        }

        fn ensure(&self, needed: usize, what: &str) -> Result<()> {
            if self.buf.remaining() < needed {
                return Err(SessionError::deserialization(format!(
                    "Not enough bytes for {}: need {}, have {}",
                    what,
                    needed,
                    self.buf.remaining()
                )));
            }
            Ok(())
        }

        pub fn get_i8(&mut self) -> Result<i8> {
            self.ensure(1, "i8")?;
            Ok(self.buf.get_i8())
        }

        pub fn get_i16(&mut self) -> Result<i16> {
            self.ensure(2, "i16")?;
            Ok(self.buf.get_i16())
        }

        pub fn get_i32(&mut self) -> Result<i32> {
            self.ensure(4, "i32")?;
            Ok(self.buf.get_i32())
        }

        pub fn get_i64(&mut self) -> Result<i64> {
            self.ensure(8, "i64")?;
            Ok(self.buf.get_i64())
        }

        pub fn get_error_code(&mut self) -> Result<ErrorCode> {
            Ok(ErrorCode::from(self.get_i16()?))
        }

        /// Split off the next `len` bytes
        pub fn take(&mut self, len: usize) -> Result<Bytes> {
            self.ensure(len, "byte slice")?;
            Ok(self.buf.split_to(len))
        }

        pub fn get_nullable_string(&mut self) -> Result<Option<String>> {
            let len = self.get_i16()?;
            if len < 0 {
                return Ok(None);
            }
            let raw = self.take(len as usize)?;
            String::from_utf8(raw.to_vec())
                .map(Some)
                .map_err(|e| SessionError::deserialization(format!("Invalid UTF-8 string: {}", e)))
        }

        /// A null string reads as empty
        pub fn get_string(&mut self) -> Result<String> {
            Ok(self.get_nullable_string()?.unwrap_or_default())
        }

        pub fn get_nullable_bytes(&mut self) -> Result<Option<Bytes>> {
            let len = self.get_i32()?;
            if len < 0 {
                return Ok(None);
            }
            self.take(len as usize).map(Some)
        }

        /// Read an array length prefix followed by its elements
        pub fn get_array<T, F>(&mut self, mut read: F) -> Result<Vec<T>>
        where
            F: FnMut(&mut Self) -> Result<T>,
        {
            let len = self.get_i32()?;
            if len <= 0 {
                return Ok(Vec::new());
            }
            // Every element is at least one byte, which bounds hostile lengths
            self.ensure(len as usize, "array")?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read(self)?);
            }
            Ok(items)
        }
    }
}
