//! Length-framed wire protocol (§6 "External interfaces").
//!
//! Request frame: `[4 frame_len][8 request_id][1 command][4 payload_len][payload]`.
//! Response frame: `[4 frame_len][8 request_id][1 status][4 payload_len][payload]`.
//! `frame_len` covers everything after itself. `status` is `0` (OK) or `1`
//! (Error). Both directions share the same `[4 payload_len][payload]`
//! tail, which this module encodes/decodes once and reuses for requests,
//! responses, and the nested ops inside an `Execute` payload.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use docdb_core::error::{Error, Result};
use docdb_core::limits::MAX_FRAME_SIZE;
use std::io::{Cursor, Read, Write};

/// A command the dispatcher accepts from a connected client.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenDb { name: String },
    CloseDb { db_id: u64 },
    Execute { db_id: u64, ops: Vec<Op> },
    Stats,
}

/// One document operation inside an `Execute` batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Create { collection: String, doc_id: u64, payload: Vec<u8> },
    Read { collection: String, doc_id: u64 },
    Update { collection: String, doc_id: u64, payload: Vec<u8> },
    Delete { collection: String, doc_id: u64 },
}

const CMD_OPEN_DB: u8 = 0;
const CMD_CLOSE_DB: u8 = 1;
const CMD_EXECUTE: u8 = 2;
const CMD_STATS: u8 = 3;

const OP_CREATE: u8 = 0;
const OP_READ: u8 = 1;
const OP_UPDATE: u8 = 2;
const OP_DELETE: u8 = 3;

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.write_u16::<LittleEndian>(s.len() as u16).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cur.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| Error::CorruptRecord(format!("wire string not utf8: {e}")))
}

fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    buf.write_u32::<LittleEndian>(b.len() as u32).unwrap();
    buf.extend_from_slice(b);
}

fn read_bytes(cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cur.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn encode_op(buf: &mut Vec<u8>, op: &Op) {
    match op {
        Op::Create { collection, doc_id, payload } => {
            buf.write_u8(OP_CREATE).unwrap();
            write_string(buf, collection);
            buf.write_u64::<LittleEndian>(*doc_id).unwrap();
            write_bytes(buf, payload);
        }
        Op::Read { collection, doc_id } => {
            buf.write_u8(OP_READ).unwrap();
            write_string(buf, collection);
            buf.write_u64::<LittleEndian>(*doc_id).unwrap();
        }
        Op::Update { collection, doc_id, payload } => {
            buf.write_u8(OP_UPDATE).unwrap();
            write_string(buf, collection);
            buf.write_u64::<LittleEndian>(*doc_id).unwrap();
            write_bytes(buf, payload);
        }
        Op::Delete { collection, doc_id } => {
            buf.write_u8(OP_DELETE).unwrap();
            write_string(buf, collection);
            buf.write_u64::<LittleEndian>(*doc_id).unwrap();
        }
    }
}

fn decode_op(cur: &mut Cursor<&[u8]>) -> Result<Op> {
    let tag = cur.read_u8()?;
    let collection = read_string(cur)?;
    let doc_id = cur.read_u64::<LittleEndian>()?;
    match tag {
        OP_CREATE => Ok(Op::Create { collection, doc_id, payload: read_bytes(cur)? }),
        OP_READ => Ok(Op::Read { collection, doc_id }),
        OP_UPDATE => Ok(Op::Update { collection, doc_id, payload: read_bytes(cur)? }),
        OP_DELETE => Ok(Op::Delete { collection, doc_id }),
        other => Err(Error::CorruptRecord(format!("unknown op tag {other}"))),
    }
}

/// Encode a command's `[1 command][4 payload_len][payload]` tail (the part
/// shared with the frame header, built separately by the caller).
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut payload = Vec::new();
    let tag = match command {
        Command::OpenDb { name } => {
            write_string(&mut payload, name);
            CMD_OPEN_DB
        }
        Command::CloseDb { db_id } => {
            payload.write_u64::<LittleEndian>(*db_id).unwrap();
            CMD_CLOSE_DB
        }
        Command::Execute { db_id, ops } => {
            payload.write_u64::<LittleEndian>(*db_id).unwrap();
            payload.write_u32::<LittleEndian>(ops.len() as u32).unwrap();
            for op in ops {
                encode_op(&mut payload, op);
            }
            CMD_EXECUTE
        }
        Command::Stats => CMD_STATS,
    };

    let mut out = Vec::with_capacity(1 + 4 + payload.len());
    out.write_u8(tag).unwrap();
    out.write_u32::<LittleEndian>(payload.len() as u32).unwrap();
    out.extend_from_slice(&payload);
    out
}

/// Decode a command from its `[1 command][4 payload_len][payload]` tail.
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let mut cur = Cursor::new(bytes);
    let tag = cur.read_u8()?;
    let payload_len = cur.read_u32::<LittleEndian>()? as usize;
    if payload_len as u64 > MAX_FRAME_SIZE as u64 {
        return Err(Error::InvalidPayload("command payload exceeds max frame size".into()));
    }
    let start = cur.position() as usize;
    let mut body = Cursor::new(&bytes[start..start + payload_len]);
    match tag {
        CMD_OPEN_DB => Ok(Command::OpenDb { name: read_string(&mut body)? }),
        CMD_CLOSE_DB => Ok(Command::CloseDb { db_id: body.read_u64::<LittleEndian>()? }),
        CMD_EXECUTE => {
            let db_id = body.read_u64::<LittleEndian>()?;
            let op_count = body.read_u32::<LittleEndian>()? as usize;
            let mut ops = Vec::with_capacity(op_count);
            for _ in 0..op_count {
                ops.push(decode_op(&mut body)?);
            }
            Ok(Command::Execute { db_id, ops })
        }
        CMD_STATS => Ok(Command::Stats),
        other => Err(Error::CorruptRecord(format!("unknown command tag {other}"))),
    }
}

/// A decoded request frame, everything after the leading `frame_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: u64,
    pub command: Command,
}

/// Encode a full request frame, `frame_len` included.
pub fn encode_request(request: &Request) -> Vec<u8> {
    let command_bytes = encode_command(&request.command);
    let mut body = Vec::with_capacity(8 + command_bytes.len());
    body.write_u64::<LittleEndian>(request.request_id).unwrap();
    body.extend_from_slice(&command_bytes);

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.write_u32::<LittleEndian>(body.len() as u32).unwrap();
    framed.extend_from_slice(&body);
    framed
}

/// Decode a full request frame, `frame_len` included. Returns the number of
/// bytes consumed so the caller can find where the next frame starts.
pub fn decode_request(bytes: &[u8]) -> Result<(Request, usize)> {
    if bytes.len() < 4 {
        return Err(Error::CorruptRecord("frame shorter than its length prefix".into()));
    }
    let frame_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if frame_len > MAX_FRAME_SIZE {
        return Err(Error::InvalidPayload(format!("frame of {frame_len} bytes exceeds max frame size")));
    }
    let total = 4 + frame_len as usize;
    if bytes.len() < total {
        return Err(Error::CorruptRecord("frame truncated".into()));
    }
    let mut cur = Cursor::new(&bytes[4..total]);
    let request_id = cur.read_u64::<LittleEndian>()?;
    let remaining_start = cur.position() as usize;
    let command = decode_command(&bytes[4 + remaining_start..total])?;
    Ok((Request { request_id, command }, total))
}

/// `status` byte for a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = 1,
}

/// A response frame, everything after the leading `frame_len`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: u64,
    pub status: Status,
    pub payload: Vec<u8>,
}

/// Encode a full response frame, `frame_len` included.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + 1 + 4 + response.payload.len());
    body.write_u64::<LittleEndian>(response.request_id).unwrap();
    body.write_u8(response.status as u8).unwrap();
    body.write_u32::<LittleEndian>(response.payload.len() as u32).unwrap();
    body.extend_from_slice(&response.payload);

    let mut framed = Vec::with_capacity(4 + body.len());
    framed.write_u32::<LittleEndian>(body.len() as u32).unwrap();
    framed.extend_from_slice(&body);
    framed
}

/// Decode a full response frame, `frame_len` included.
pub fn decode_response(bytes: &[u8]) -> Result<(Response, usize)> {
    if bytes.len() < 4 {
        return Err(Error::CorruptRecord("frame shorter than its length prefix".into()));
    }
    let frame_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if frame_len > MAX_FRAME_SIZE {
        return Err(Error::InvalidPayload(format!("frame of {frame_len} bytes exceeds max frame size")));
    }
    let total = 4 + frame_len as usize;
    if bytes.len() < total {
        return Err(Error::CorruptRecord("frame truncated".into()));
    }
    let mut cur = Cursor::new(&bytes[4..total]);
    let request_id = cur.read_u64::<LittleEndian>()?;
    let status = match cur.read_u8()? {
        0 => Status::Ok,
        1 => Status::Error,
        other => return Err(Error::CorruptRecord(format!("unknown status byte {other}"))),
    };
    let payload_len = cur.read_u32::<LittleEndian>()? as usize;
    let payload_start = 4 + cur.position() as usize;
    let payload = bytes[payload_start..payload_start + payload_len].to_vec();
    Ok((Response { request_id, status, payload }, total))
}
