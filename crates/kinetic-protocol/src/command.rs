//! Command decoding from RESP frames.
//!
//! A command is an array whose first element names the operation,
//! followed by its positional arguments and then any number of
//! `NAME value` options:
//!
//! ```text
//! PUT <key> <value>      GET <key>          GETVERSION <key>
//! GETNEXT <key>          GETPREVIOUS <key>  DELETE <key>
//! FLUSH                  NOOP
//! STARTBATCH <id>        ENDBATCH <id> <count>        ABORTBATCH <id>
//!
//! options: SEQ n, PRIORITY p, TIMEOUT ms, BATCH id, SYNC mode,
//!          VERSION v, NEWVERSION v, CLUSTER n, USER n, FORCE
//! ```

use bytes::Bytes;
use kinetic_core::{Command, IncomingCommand, OpKind, Priority, Synchronization};

use crate::error::ProtocolError;
use crate::types::Frame;

/// Turns frames from one connection into commands.
///
/// Commands that omit `SEQ` get one more than the highest sequence seen so
/// far on the connection, so simple clients never have to count.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    last_sequence: Option<u64>,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn decode(&mut self, frame: Frame) -> Result<IncomingCommand, ProtocolError> {
        let (mut incoming, explicit_seq) = parse_command(frame)?;
        let seq = match explicit_seq {
            Some(seq) => seq,
            None => self.last_sequence.map_or(1, |s| s.saturating_add(1)),
        };
        incoming.command.sequence = seq;
        self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
        Ok(incoming)
    }
}

fn parse_command(frame: Frame) -> Result<(IncomingCommand, Option<u64>), ProtocolError> {
    let Frame::Array(frames) = frame else {
        return Err(ProtocolError::InvalidCommandFrame("expected array frame".into()));
    };
    let Some((name, args)) = frames.split_first() else {
        return Err(ProtocolError::InvalidCommandFrame("empty command array".into()));
    };
    let name = text(name)?.to_ascii_uppercase();

    let (op, positional) = match name.as_str() {
        "PUT" => (OpKind::Put, 2),
        "GET" => (OpKind::Get, 1),
        "GETVERSION" => (OpKind::GetVersion, 1),
        "GETNEXT" => (OpKind::GetNext, 1),
        "GETPREVIOUS" => (OpKind::GetPrevious, 1),
        "DELETE" | "DEL" => (OpKind::Delete, 1),
        "FLUSH" => (OpKind::Flush, 0),
        "NOOP" | "PING" => (OpKind::Noop, 0),
        "STARTBATCH" => (OpKind::StartBatch, 1),
        "ENDBATCH" => (OpKind::EndBatch, 2),
        "ABORTBATCH" => (OpKind::AbortBatch, 1),
        _ => return Err(ProtocolError::UnknownCommand(name)),
    };
    if args.len() < positional {
        return Err(ProtocolError::WrongArity(name));
    }

    let mut cmd = Command::new(op, 0);
    let mut value = None;
    let (pos, opts) = args.split_at(positional);
    match op {
        OpKind::Put => {
            cmd.key = bytes(&pos[0])?;
            value = Some(bytes(&pos[1])?);
        }
        OpKind::Get | OpKind::GetVersion | OpKind::GetNext | OpKind::GetPrevious | OpKind::Delete => {
            cmd.key = bytes(&pos[0])?;
        }
        OpKind::StartBatch | OpKind::AbortBatch => {
            cmd.batch_id = Some(number(&pos[0], "batch id")?);
        }
        OpKind::EndBatch => {
            cmd.batch_id = Some(number(&pos[0], "batch id")?);
            cmd.batch_count = number(&pos[1], "batch count")?;
        }
        OpKind::Flush | OpKind::Noop => {}
    }

    let seq = apply_options(&mut cmd, opts)?;
    Ok((IncomingCommand::new(cmd, value), seq))
}

/// Applies trailing options to `cmd`, returning the `SEQ` if one was given.
fn apply_options(cmd: &mut Command, mut opts: &[Frame]) -> Result<Option<u64>, ProtocolError> {
    let mut seq = None;
    while let Some((name, rest)) = opts.split_first() {
        let name = text(name)?.to_ascii_uppercase();
        if name == "FORCE" {
            cmd.force = true;
            opts = rest;
            continue;
        }
        let Some((arg, rest)) = rest.split_first() else {
            return Err(ProtocolError::InvalidOption(format!("{name} needs a value")));
        };
        match name.as_str() {
            "SEQ" => seq = Some(number(arg, "SEQ")?),
            "PRIORITY" => {
                cmd.priority = text(arg)?
                    .parse::<Priority>()
                    .map_err(ProtocolError::InvalidOption)?;
            }
            "TIMEOUT" => cmd.timeout_ms = number(arg, "TIMEOUT")?,
            "BATCH" => cmd.batch_id = Some(number(arg, "BATCH")?),
            "SYNC" => {
                cmd.synchronization = Some(
                    text(arg)?
                        .parse::<Synchronization>()
                        .map_err(ProtocolError::InvalidOption)?,
                );
            }
            "VERSION" => cmd.db_version = Some(bytes(arg)?),
            "NEWVERSION" => cmd.new_version = Some(bytes(arg)?),
            "CLUSTER" => cmd.cluster_version = number(arg, "CLUSTER")?,
            "USER" => cmd.user_id = number(arg, "USER")?,
            _ => return Err(ProtocolError::InvalidOption(format!("unknown option '{name}'"))),
        }
        opts = rest;
    }
    Ok(seq)
}

/// Builds the frame a client sends for `incoming`, always carrying `SEQ`.
pub fn encode_command(incoming: &IncomingCommand) -> Frame {
    let cmd = &incoming.command;
    let name = match cmd.op {
        OpKind::Get => "GET",
        OpKind::GetVersion => "GETVERSION",
        OpKind::GetNext => "GETNEXT",
        OpKind::GetPrevious => "GETPREVIOUS",
        OpKind::Put => "PUT",
        OpKind::Delete => "DELETE",
        OpKind::Flush => "FLUSH",
        OpKind::Noop => "NOOP",
        OpKind::StartBatch => "STARTBATCH",
        OpKind::EndBatch => "ENDBATCH",
        OpKind::AbortBatch => "ABORTBATCH",
    };
    let mut parts = vec![bulk_str(name)];
    let mut batch_positional = false;
    match cmd.op {
        OpKind::Put => {
            parts.push(Frame::Bulk(cmd.key.clone()));
            parts.push(Frame::Bulk(incoming.value.clone().unwrap_or_default()));
        }
        OpKind::Get | OpKind::GetVersion | OpKind::GetNext | OpKind::GetPrevious | OpKind::Delete => {
            parts.push(Frame::Bulk(cmd.key.clone()));
        }
        OpKind::StartBatch | OpKind::AbortBatch => {
            parts.push(bulk_num(cmd.batch_id.unwrap_or_default()));
            batch_positional = true;
        }
        OpKind::EndBatch => {
            parts.push(bulk_num(cmd.batch_id.unwrap_or_default()));
            parts.push(bulk_num(cmd.batch_count));
            batch_positional = true;
        }
        OpKind::Flush | OpKind::Noop => {}
    }

    push_opt(&mut parts, "SEQ", bulk_num(cmd.sequence));
    if cmd.priority != Priority::default() {
        push_opt(&mut parts, "PRIORITY", bulk_str(cmd.priority.as_str()));
    }
    if cmd.timeout_ms != 0 {
        push_opt(&mut parts, "TIMEOUT", bulk_num(cmd.timeout_ms));
    }
    if let (Some(id), false) = (cmd.batch_id, batch_positional) {
        push_opt(&mut parts, "BATCH", bulk_num(id));
    }
    if let Some(sync) = cmd.synchronization {
        let mode = match sync {
            Synchronization::WriteThrough => "writethrough",
            Synchronization::WriteBack => "writeback",
            Synchronization::Flush => "flush",
        };
        push_opt(&mut parts, "SYNC", bulk_str(mode));
    }
    if let Some(v) = &cmd.db_version {
        push_opt(&mut parts, "VERSION", Frame::Bulk(v.clone()));
    }
    if let Some(v) = &cmd.new_version {
        push_opt(&mut parts, "NEWVERSION", Frame::Bulk(v.clone()));
    }
    if cmd.cluster_version != 0 {
        push_opt(&mut parts, "CLUSTER", bulk_num(cmd.cluster_version));
    }
    if cmd.user_id != 0 {
        push_opt(&mut parts, "USER", bulk_num(cmd.user_id));
    }
    if cmd.force {
        parts.push(bulk_str("FORCE"));
    }
    Frame::Array(parts)
}

fn push_opt(parts: &mut Vec<Frame>, name: &str, value: Frame) {
    parts.push(bulk_str(name));
    parts.push(value);
}

fn bulk_str(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn bulk_num(n: impl itoa::Integer) -> Frame {
    let mut buf = itoa::Buffer::new();
    bulk_str(buf.format(n))
}

fn text(frame: &Frame) -> Result<&str, ProtocolError> {
    match frame {
        Frame::Bulk(data) => std::str::from_utf8(data)
            .map_err(|_| ProtocolError::InvalidCommandFrame("argument is not valid utf-8".into())),
        Frame::Simple(s) => Ok(s),
        _ => Err(ProtocolError::InvalidCommandFrame(
            "expected bulk or simple string".into(),
        )),
    }
}

fn bytes(frame: &Frame) -> Result<Bytes, ProtocolError> {
    match frame {
        Frame::Bulk(data) => Ok(data.clone()),
        Frame::Simple(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        _ => Err(ProtocolError::InvalidCommandFrame(
            "expected bulk or simple string".into(),
        )),
    }
}

fn number<T: std::str::FromStr>(frame: &Frame, what: &str) -> Result<T, ProtocolError> {
    if let Frame::Integer(n) = frame {
        return n
            .to_string()
            .parse()
            .map_err(|_| ProtocolError::InvalidOption(format!("{what} out of range")));
    }
    text(frame)?
        .parse()
        .map_err(|_| ProtocolError::InvalidOption(format!("{what} is not a valid integer")))
}
