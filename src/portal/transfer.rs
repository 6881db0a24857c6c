//! Transfer engine: file framing, chunked send with backpressure, inbound
//! reassembly and the transfer history ledger.
//!
//! Framing on the data channel is deliberately minimal. A transfer is one
//! metadata frame (UTF-8 JSON with a top-level `meta` key) followed by raw
//! binary chunks in order. A frame is treated as metadata only if it decodes
//! as UTF-8 and starts with the exact `{"meta":` prefix; everything else is
//! chunk data. The `HEARTBEAT` liveness token never reaches this module.

use std::path::Path;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PortalError, Result};

/// Liveness token exchanged while connected. Filtered out before frames
/// reach the engine.
pub const HEARTBEAT: &[u8] = b"HEARTBEAT";

const META_PREFIX: &[u8] = b"{\"meta\":";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Serialize, Deserialize)]
struct MetaFrame {
    meta: TransferMeta,
}

pub fn encode_metadata(meta: &TransferMeta) -> Bytes {
    // Serialization of a struct with string/number fields cannot fail
    let json = serde_json::to_string(&MetaFrame { meta: meta.clone() })
        .unwrap_or_default();
    Bytes::from(json)
}

/// Returns the metadata record if `frame` is a metadata frame, `None` if it
/// must be treated as a binary chunk.
pub fn decode_metadata(frame: &[u8]) -> Option<TransferMeta> {
    if !frame.starts_with(META_PREFIX) {
        return None;
    }
    let text = std::str::from_utf8(frame).ok()?;
    serde_json::from_str::<MetaFrame>(text).ok().map(|f| f.meta)
}

pub fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("txt") | Some("md") => "text/plain",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// A file handed to the engine for sending.
#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl OutboundFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        Ok(Self {
            name,
            mime_type: guess_mime(path).to_string(),
            data: Bytes::from(data),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Error,
}

/// One entry in the transfer history ledger. Never deleted automatically;
/// `payload` is populated only for completed incoming transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferItem {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub progress: u8,
    pub payload: Option<Bytes>,
}

/// Result of one outbound pump pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Nothing staged for sending.
    Idle,
    /// The transport's buffer filled; resume on the next drain event.
    Suspended,
    Finished(Uuid),
}

/// Result of dispatching one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Started(Uuid),
    Chunk { id: Uuid, progress: u8 },
    Completed(Uuid),
    /// Chunk with no open cursor: protocol desynchronization, discarded.
    Ignored,
}

struct OutboundCursor {
    item_id: Uuid,
    metadata: Bytes,
    metadata_sent: bool,
    data: Bytes,
    offset: usize,
}

struct ReceiveCursor {
    item_id: Uuid,
    expected: u64,
    received: u64,
    chunks: Vec<Bytes>,
}

pub struct TransferEngine {
    chunk_size: usize,
    history: Vec<TransferItem>,
    outbound: Option<OutboundCursor>,
    inbound: Option<ReceiveCursor>,
}

impl TransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            history: Vec::new(),
            outbound: None,
            inbound: None,
        }
    }

    /// Most recent first.
    pub fn history(&self) -> &[TransferItem] {
        &self.history
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Id of the item owning the staged outbound cursor, if any.
    pub fn active_outbound(&self) -> Option<Uuid> {
        self.outbound.as_ref().map(|c| c.item_id)
    }

    fn item_mut(&mut self, id: Uuid) -> Option<&mut TransferItem> {
        self.history.iter_mut().find(|i| i.id == id)
    }

    /// Stage a file for sending. The engine is connection-agnostic; the
    /// caller is responsible for only pumping while connected.
    pub fn start_send(&mut self, file: OutboundFile) -> Result<Uuid> {
        if self.outbound.is_some() {
            return Err(PortalError::SendInProgress);
        }

        let id = Uuid::new_v4();
        let size = file.data.len() as u64;
        info!("Starting send of {} ({} bytes)", file.name, size);

        self.history.insert(
            0,
            TransferItem {
                id,
                name: file.name.clone(),
                size,
                mime_type: file.mime_type.clone(),
                direction: Direction::Outgoing,
                status: TransferStatus::Transferring,
                progress: 0,
                payload: None,
            },
        );

        let meta = TransferMeta {
            id,
            name: file.name,
            size,
            mime_type: file.mime_type,
        };
        self.outbound = Some(OutboundCursor {
            item_id: id,
            metadata: encode_metadata(&meta),
            metadata_sent: false,
            data: file.data,
            offset: 0,
        });

        Ok(id)
    }

    /// Record a send that was refused before any frame went out, so the
    /// dropped file is still visible in the ledger.
    pub fn record_rejected(&mut self, file: OutboundFile) -> Uuid {
        let id = Uuid::new_v4();
        warn!("Recording rejected send of {}", file.name);
        self.history.insert(
            0,
            TransferItem {
                id,
                name: file.name,
                size: file.data.len() as u64,
                mime_type: file.mime_type,
                direction: Direction::Outgoing,
                status: TransferStatus::Error,
                progress: 0,
                payload: None,
            },
        );
        id
    }

    /// Mark an item failed and drop its outbound cursor if it owns one.
    pub fn fail_item(&mut self, id: Uuid) {
        if self.outbound.as_ref().is_some_and(|c| c.item_id == id) {
            self.outbound = None;
        }
        if let Some(item) = self.item_mut(id) {
            item.status = TransferStatus::Error;
        }
    }

    /// Push staged frames through `send` until done, suspended or failed.
    ///
    /// `send` returns `Ok(true)` when the frame was accepted and more may
    /// follow, `Ok(false)` when the frame was accepted but the buffer is now
    /// full. Suspension keeps the exact byte position; call again on drain.
    pub fn pump_outbound<F>(&mut self, mut send: F) -> Result<PumpOutcome>
    where
        F: FnMut(Bytes) -> Result<bool>,
    {
        let Some(mut cursor) = self.outbound.take() else {
            return Ok(PumpOutcome::Idle);
        };
        let id = cursor.item_id;
        let total = cursor.data.len();

        if !cursor.metadata_sent {
            let keep_going = match send(cursor.metadata.clone()) {
                Ok(k) => k,
                Err(e) => {
                    self.fail_item(id);
                    return Err(e);
                }
            };
            cursor.metadata_sent = true;
            if total == 0 {
                if let Some(item) = self.item_mut(id) {
                    item.status = TransferStatus::Completed;
                    item.progress = 100;
                }
                return Ok(PumpOutcome::Finished(id));
            }
            if !keep_going {
                self.outbound = Some(cursor);
                return Ok(PumpOutcome::Suspended);
            }
        }

        loop {
            let end = (cursor.offset + self.chunk_size).min(total);
            let chunk = cursor.data.slice(cursor.offset..end);

            let keep_going = match send(chunk) {
                Ok(k) => k,
                Err(e) => {
                    self.fail_item(id);
                    return Err(e);
                }
            };
            cursor.offset = end;

            let progress = (end as u64 * 100 / total as u64) as u8;
            if let Some(item) = self.item_mut(id) {
                item.progress = progress;
            }

            if end >= total {
                if let Some(item) = self.item_mut(id) {
                    item.status = TransferStatus::Completed;
                    item.progress = 100;
                }
                debug!("Send complete for {}", id);
                return Ok(PumpOutcome::Finished(id));
            }
            if !keep_going {
                self.outbound = Some(cursor);
                return Ok(PumpOutcome::Suspended);
            }
        }
    }

    /// Dispatch one inbound frame: a metadata record opens a fresh receive
    /// cursor, anything else is appended to the open cursor as a chunk.
    pub fn on_inbound_frame(&mut self, frame: Bytes) -> InboundOutcome {
        if let Some(meta) = decode_metadata(&frame) {
            if let Some(prev) = self.inbound.take() {
                // The abandoned item stays Transferring in the ledger
                warn!(
                    "New metadata before previous transfer finished, abandoning {}",
                    prev.item_id
                );
            }

            let id = meta.id;
            info!("Receiving {} ({} bytes)", meta.name, meta.size);
            self.history.insert(
                0,
                TransferItem {
                    id,
                    name: meta.name,
                    size: meta.size,
                    mime_type: meta.mime_type,
                    direction: Direction::Incoming,
                    status: TransferStatus::Transferring,
                    progress: 0,
                    payload: None,
                },
            );

            if meta.size == 0 {
                if let Some(item) = self.item_mut(id) {
                    item.status = TransferStatus::Completed;
                    item.progress = 100;
                    item.payload = Some(Bytes::new());
                }
                return InboundOutcome::Completed(id);
            }

            self.inbound = Some(ReceiveCursor {
                item_id: id,
                expected: meta.size,
                received: 0,
                chunks: Vec::new(),
            });
            return InboundOutcome::Started(id);
        }

        let Some(cursor) = self.inbound.as_mut() else {
            let desync = PortalError::ProtocolDesync(format!(
                "chunk of {} bytes with no open transfer",
                frame.len()
            ));
            warn!("Discarding frame: {}", desync);
            return InboundOutcome::Ignored;
        };

        cursor.received += frame.len() as u64;
        cursor.chunks.push(frame);

        let id = cursor.item_id;
        let progress = (cursor.received * 100 / cursor.expected).min(100) as u8;

        if cursor.received >= cursor.expected {
            let cursor = self.inbound.take().expect("cursor present");
            let mut payload = BytesMut::with_capacity(cursor.received as usize);
            for chunk in &cursor.chunks {
                payload.extend_from_slice(chunk);
            }
            if let Some(item) = self.item_mut(id) {
                item.status = TransferStatus::Completed;
                item.progress = 100;
                item.payload = Some(payload.freeze());
            }
            debug!("Receive complete for {}", id);
            return InboundOutcome::Completed(id);
        }

        if let Some(item) = self.item_mut(id) {
            item.progress = progress;
        }
        InboundOutcome::Chunk { id, progress }
    }
}
