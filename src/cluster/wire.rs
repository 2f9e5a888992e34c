//! Wire records for slave-list and cluster-info replies.
//!
//! Two encodings are supported:
//!
//! - **Legacy**: fixed little-endian records, byte compatible with existing
//!   slave and client binaries. Strings are NUL terminated.
//! - **V1**: a version tag, a `u32` length, then a bincode payload.
//!
//! Legacy slave record:
//!
//! ```text
//! [i32 id][cstr ip][i32 port][i64 avail][i64 used][i64 mem][i64 cpu]
//! [i64 in][i64 out][i64 timestamp][i64 status][i64 leaf][i64 path_len][cstr storage_path]
//! ```
//!
//! Legacy cluster record:
//!
//! ```text
//! [i32 id][i32 nodes][i64 avail][i64 used][i64 in][i64 out]
//! ```

use super::tree::ClusterStat;
use crate::error::{Result, SectorError};
use crate::types::{SlaveNode, SlaveStatus};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version tag of the length-prefixed encoding.
pub const WIRE_V1: u8 = 1;

const V1_HEADER_LEN: usize = 1 + 4;

/// One slave as reported to clients and slaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveRecord {
    pub id: i32,
    pub ip: String,
    pub port: i32,
    pub available_disk_space: i64,
    pub used_space: i64,
    pub mem_used: i64,
    pub cpu_used: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
    pub timestamp: i64,
    pub status: i64,
    pub leaf_cluster: i64,
    pub path_len: i64,
    pub storage_path: String,
}

impl SlaveRecord {
    pub fn status(&self) -> Option<SlaveStatus> {
        SlaveStatus::from_code(self.status)
    }
}

impl From<&SlaveNode> for SlaveRecord {
    fn from(node: &SlaveNode) -> Self {
        Self {
            id: clamp_i32(node.id as i64),
            ip: node.address.ip.clone(),
            port: node.address.port as i32,
            available_disk_space: clamp_i64(node.available_disk_space),
            used_space: clamp_i64(node.total_file_size),
            mem_used: clamp_i64(node.mem_used),
            cpu_used: clamp_i64(node.cpu_used),
            in_bytes: clamp_i64(node.total_in()),
            out_bytes: clamp_i64(node.total_out()),
            timestamp: node.report_timestamp,
            status: node.status.code(),
            leaf_cluster: node.leaf_cluster() as i64,
            path_len: node.path.len() as i64,
            storage_path: node.storage_path.clone(),
        }
    }
}

/// One top-level cluster as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: i32,
    pub total_nodes: i32,
    pub available_disk_space: i64,
    pub used_space: i64,
    pub in_bytes: i64,
    pub out_bytes: i64,
}

impl ClusterRecord {
    pub fn new(id: i32, stat: &ClusterStat) -> Self {
        Self {
            id,
            total_nodes: clamp_i32(stat.total_nodes as i64),
            available_disk_space: clamp_i64(stat.available_disk_space),
            used_space: clamp_i64(stat.total_file_size),
            in_bytes: clamp_i64(stat.total_in()),
            out_bytes: clamp_i64(stat.total_out()),
        }
    }
}

/// Append one legacy slave record to `buf`.
pub fn put_slave_legacy(buf: &mut BytesMut, record: &SlaveRecord) {
    buf.put_i32_le(record.id);
    put_cstr(buf, &record.ip);
    buf.put_i32_le(record.port);
    buf.put_i64_le(record.available_disk_space);
    buf.put_i64_le(record.used_space);
    buf.put_i64_le(record.mem_used);
    buf.put_i64_le(record.cpu_used);
    buf.put_i64_le(record.in_bytes);
    buf.put_i64_le(record.out_bytes);
    buf.put_i64_le(record.timestamp);
    buf.put_i64_le(record.status);
    buf.put_i64_le(record.leaf_cluster);
    buf.put_i64_le(record.path_len);
    put_cstr(buf, &record.storage_path);
}

/// Read one legacy slave record from the front of `buf`.
pub fn get_slave_legacy(buf: &mut impl Buf) -> Result<SlaveRecord> {
    let id = get_i32(buf)?;
    let ip = get_cstr(buf)?;
    let port = get_i32(buf)?;
    Ok(SlaveRecord {
        id,
        ip,
        port,
        available_disk_space: get_i64(buf)?,
        used_space: get_i64(buf)?,
        mem_used: get_i64(buf)?,
        cpu_used: get_i64(buf)?,
        in_bytes: get_i64(buf)?,
        out_bytes: get_i64(buf)?,
        timestamp: get_i64(buf)?,
        status: get_i64(buf)?,
        leaf_cluster: get_i64(buf)?,
        path_len: get_i64(buf)?,
        storage_path: get_cstr(buf)?,
    })
}

/// Append one legacy cluster record to `buf`.
pub fn put_cluster_legacy(buf: &mut BytesMut, record: &ClusterRecord) {
    buf.put_i32_le(record.id);
    buf.put_i32_le(record.total_nodes);
    buf.put_i64_le(record.available_disk_space);
    buf.put_i64_le(record.used_space);
    buf.put_i64_le(record.in_bytes);
    buf.put_i64_le(record.out_bytes);
}

/// Read one legacy cluster record from the front of `buf`.
pub fn get_cluster_legacy(buf: &mut impl Buf) -> Result<ClusterRecord> {
    Ok(ClusterRecord {
        id: get_i32(buf)?,
        total_nodes: get_i32(buf)?,
        available_disk_space: get_i64(buf)?,
        used_space: get_i64(buf)?,
        in_bytes: get_i64(buf)?,
        out_bytes: get_i64(buf)?,
    })
}

/// Concatenated legacy slave records. The record count travels separately.
pub fn encode_slave_list(records: &[SlaveRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.len() * 128);
    for record in records {
        put_slave_legacy(&mut buf, record);
    }
    buf.freeze()
}

/// Decode concatenated legacy slave records until `data` is exhausted.
pub fn decode_slave_list(mut data: &[u8]) -> Result<Vec<SlaveRecord>> {
    let mut records = Vec::new();
    while data.has_remaining() {
        records.push(get_slave_legacy(&mut data)?);
    }
    Ok(records)
}

/// Concatenated legacy cluster records.
pub fn encode_cluster_info(records: &[ClusterRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.len() * 40);
    for record in records {
        put_cluster_legacy(&mut buf, record);
    }
    buf.freeze()
}

/// Decode concatenated legacy cluster records until `data` is exhausted.
pub fn decode_cluster_info(mut data: &[u8]) -> Result<Vec<ClusterRecord>> {
    let mut records = Vec::new();
    while data.has_remaining() {
        records.push(get_cluster_legacy(&mut data)?);
    }
    Ok(records)
}

/// Encode `value` as `[u8 version][u32 len][bincode]`.
pub fn encode_v1<T: Serialize>(value: &T) -> Result<Bytes> {
    let payload = bincode::serialize(value)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| {
            SectorError::Serialization(format!("payload of {} bytes too large", payload.len()))
        })?;

    let mut buf = BytesMut::with_capacity(V1_HEADER_LEN + payload.len());
    buf.put_u8(WIRE_V1);
    buf.put_u32_le(len);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a value written by [`encode_v1`].
pub fn decode_v1<T: DeserializeOwned>(mut data: &[u8]) -> Result<T> {
    if data.remaining() < V1_HEADER_LEN {
        return Err(SectorError::Deserialization("truncated header".to_string()));
    }
    let version = data.get_u8();
    if version != WIRE_V1 {
        return Err(SectorError::Deserialization(format!(
            "unsupported wire version {}",
            version
        )));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() != len {
        return Err(SectorError::Deserialization(format!(
            "length mismatch: header says {}, got {}",
            len,
            data.remaining()
        )));
    }
    Ok(bincode::deserialize(data)?)
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut impl Buf) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(SectorError::Deserialization("unterminated string".to_string()));
        }
        match buf.get_u8() {
            0 => break,
            b => bytes.push(b),
        }
    }
    String::from_utf8(bytes).map_err(|e| SectorError::Deserialization(e.to_string()))
}

fn get_i32(buf: &mut impl Buf) -> Result<i32> {
    ensure(buf.remaining(), 4)?;
    Ok(buf.get_i32_le())
}

fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    ensure(buf.remaining(), 8)?;
    Ok(buf.get_i64_le())
}

fn ensure(remaining: usize, n: usize) -> Result<()> {
    if remaining < n {
        return Err(SectorError::Deserialization(format!(
            "need {} bytes, {} left",
            n, remaining
        )));
    }
    Ok(())
}

fn clamp_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn clamp_i32(v: i64) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
