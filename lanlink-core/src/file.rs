//! File transfer: offer, accept, chunk stream, reassembly and confirmation.
//!
//! A file id moves `offered -> accepted -> accumulating -> complete` and never back. The
//! sender streams chunks from a host task (see [`FileSendJob`]); every chunk is ACK-tracked
//! under `{file_id}_chunk_{index}`.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;

use crate::chunk::{mime_type_for, ChunkInsert, FileSendJob, IncomingTransfer};
use crate::core::{CoreError, DispatchError, Event, Node, OutboundAction};
use crate::identity::{random_hex_id, PeerId};
use crate::integrity;
use crate::protocol::{chunk_ack_key, Message, MessageKind};
use crate::reliable::RecentKeys;
use crate::router::Inbound;
use crate::token::{self, Scope};
use crate::wire::EncodeError;

/// Sender side: parked until the recipient accepts.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_id: String,
    pub to: PeerId,
    pub filename: String,
    pub token: String,
    pub data: Arc<[u8]>,
    pub offered_at: f64,
}

/// Receiver side: announced, not yet accepted.
#[derive(Debug, Clone)]
pub struct FileOffer {
    pub file_id: String,
    pub from: PeerId,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
    pub description: String,
    pub hash: Option<String>,
    pub received_at: f64,
}

#[derive(Debug, Default)]
pub struct FileState {
    outgoing: HashMap<String, OutgoingFile>,
    offers: HashMap<String, FileOffer>,
    transfers: HashMap<String, IncomingTransfer>,
    /// Accepted outgoing ids awaiting FILE_RECEIVED: recipient and when streaming began.
    awaiting_receipt: HashMap<String, (PeerId, f64)>,
    /// Recently finished file ids; re-offers and late chunks for these are ignored.
    completed: RecentKeys,
}

impl FileState {
    fn is_known(&self, file_id: &str) -> bool {
        self.offers.contains_key(file_id)
            || self.transfers.contains_key(file_id)
            || self.completed.contains(file_id)
    }

    pub(crate) fn drop_idle(&mut self, now: f64, ttl: f64) -> usize {
        let count = |f: &Self| {
            f.offers.len() + f.transfers.len() + f.outgoing.len() + f.awaiting_receipt.len()
        };
        let before = count(self);
        self.offers.retain(|_, o| now - o.received_at <= ttl);
        self.transfers.retain(|_, t| now - t.last_activity <= ttl);
        self.outgoing.retain(|_, o| now - o.offered_at <= ttl);
        self.awaiting_receipt.retain(|_, (_, at)| now - *at <= ttl);
        before - count(self)
    }
}

impl Node {
    /// Offer `data` to a peer. Returns the new file id with the actions.
    ///
    /// An empty payload is complete on the sending side at once: the offer still goes out so
    /// the recipient can create the file, but nothing is parked and no chunk is ever sent.
    pub fn send_file(
        &mut self,
        peer: &PeerId,
        filename: &str,
        data: Vec<u8>,
        description: &str,
        now: f64,
    ) -> Result<(String, Vec<OutboundAction>), CoreError> {
        let to = self.peer_addr(peer)?;
        let file_id = random_hex_id(8);
        let token = self.issue_token(Scope::File, now);
        let msg = Message::FileOffer {
            from: self.profile.id.clone(),
            to: peer.clone(),
            file_id: file_id.clone(),
            filename: filename.to_string(),
            filesize: data.len() as u64,
            filetype: mime_type_for(filename).to_string(),
            description: description.to_string(),
            timestamp: now,
            token: token.clone(),
            hash: Some(integrity::hash_hex(&data)),
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        if data.is_empty() {
            tracing::info!(file = %file_id, "empty file, nothing to stream");
            out.push(OutboundAction::Notify(Event::FileDelivered {
                file_id: file_id.clone(),
                to: peer.clone(),
            }));
        } else {
            self.files.outgoing.insert(
                file_id.clone(),
                OutgoingFile {
                    file_id: file_id.clone(),
                    to: peer.clone(),
                    filename: filename.to_string(),
                    token,
                    data: Arc::from(data),
                    offered_at: now,
                },
            );
        }
        Ok((file_id, out))
    }

    /// Accept a pending offer and tell the sender to start streaming.
    pub fn accept_file(&mut self, file_id: &str, now: f64) -> Result<Vec<OutboundAction>, CoreError> {
        let offer = self
            .files
            .offers
            .get(file_id)
            .ok_or_else(|| CoreError::UnknownFileOffer(file_id.to_string()))?;
        let to = self
            .id_addr(&offer.from)
            .ok_or_else(|| CoreError::UnknownPeer(offer.from.clone()))?;
        let msg = Message::FileAccepted {
            from: self.profile.id.clone(),
            to: offer.from.clone(),
            file_id: file_id.to_string(),
            timestamp: now,
        };
        let mut out = Vec::new();
        self.emit(&mut out, to, &msg, now)?;
        let Some(offer) = self.files.offers.remove(file_id) else {
            return Ok(out);
        };
        let transfer = IncomingTransfer::new(
            file_id,
            &offer.from,
            &offer.filename,
            offer.filesize,
            offer.hash,
            now,
        );
        if transfer.is_complete() {
            self.complete_transfer(&mut out, transfer, to, now)?;
        } else {
            self.files.transfers.insert(file_id.to_string(), transfer);
        }
        Ok(out)
    }

    /// Build and register FILE_CHUNK `index` of an accepted job. Empty once past the last chunk.
    pub fn send_file_chunk(
        &mut self,
        job: &FileSendJob,
        index: usize,
        now: f64,
    ) -> Result<Vec<OutboundAction>, EncodeError> {
        let mut out = Vec::new();
        if let Some(msg) = job.chunk_message(&self.profile.id, index) {
            self.emit(&mut out, job.destination, &msg, now)?;
        }
        Ok(out)
    }

    fn complete_transfer(
        &mut self,
        out: &mut Vec<OutboundAction>,
        transfer: IncomingTransfer,
        reply_to: std::net::SocketAddr,
        now: f64,
    ) -> Result<(), EncodeError> {
        let data = transfer.reassemble_into_bytes();
        let verified = if data.len() as u64 != transfer.filesize {
            tracing::warn!(
                file = %transfer.file_id,
                claimed = transfer.filesize,
                got = data.len(),
                "file size mismatch"
            );
            Some(false)
        } else {
            transfer
                .hash
                .as_deref()
                .map(|h| integrity::verify_hex(&data, h))
        };
        if verified == Some(false) {
            tracing::warn!(file = %transfer.file_id, "file failed verification");
        }
        tracing::info!(file = %transfer.file_id, bytes = data.len(), from = %transfer.from, "file received");
        self.files.completed.insert(&transfer.file_id);
        let msg = Message::FileReceived {
            from: self.profile.id.clone(),
            to: transfer.from.clone(),
            file_id: transfer.file_id.clone(),
            status: "COMPLETE".to_string(),
            timestamp: now,
        };
        self.emit(out, reply_to, &msg, now)?;
        out.push(OutboundAction::Notify(Event::FileReceived {
            file_id: transfer.file_id,
            from: transfer.from,
            filename: transfer.filename,
            data,
            verified,
        }));
        Ok(())
    }

    pub fn pending_offers(&self) -> impl Iterator<Item = &FileOffer> {
        self.files.offers.values()
    }

    pub fn incoming_transfers(&self) -> impl Iterator<Item = &IncomingTransfer> {
        self.files.transfers.values()
    }

    pub fn outgoing_files(&self) -> impl Iterator<Item = &OutgoingFile> {
        self.files.outgoing.values()
    }
}

pub(crate) fn handle_offer(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::FileOffer {
        from,
        to,
        file_id,
        filename,
        filesize,
        filetype,
        description,
        token: raw_token,
        hash,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::File, Some(&from), inbound.now) {
        return Err(DispatchError::Unauthorized {
            kind: MessageKind::FileOffer,
            reason: "invalid file token",
        });
    }
    if node.files.is_known(&file_id) {
        return Ok(());
    }
    node.files.offers.insert(
        file_id.clone(),
        FileOffer {
            file_id: file_id.clone(),
            from: from.clone(),
            filename: filename.clone(),
            filesize,
            filetype,
            description: description.clone(),
            hash,
            received_at: inbound.now,
        },
    );
    out.push(OutboundAction::Notify(Event::FileOffered {
        file_id,
        from,
        filename,
        filesize,
        description,
    }));
    Ok(())
}

pub(crate) fn handle_accepted(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::FileAccepted {
        from, to, file_id, ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !node
        .files
        .outgoing
        .get(&file_id)
        .is_some_and(|f| f.to == from)
    {
        return Ok(());
    }
    let Some(file) = node.files.outgoing.remove(&file_id) else {
        return Ok(());
    };
    tracing::info!(file = %file_id, to = %from, bytes = file.data.len(), "offer accepted, streaming");
    node.files
        .awaiting_receipt
        .insert(file_id.clone(), (file.to.clone(), inbound.now));
    out.push(OutboundAction::StartFileSend(FileSendJob {
        file_id,
        to: file.to,
        destination: inbound.source,
        token: file.token,
        data: file.data,
        chunk_size: node.config.timings.chunk_size,
        delay_ms: node.config.timings.chunk_delay_ms,
    }));
    Ok(())
}

pub(crate) fn handle_chunk(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::FileChunk {
        from,
        to,
        file_id,
        chunk_index,
        total_chunks,
        token: raw_token,
        data,
        ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    if !token::validate(&raw_token, Scope::File, Some(&from), inbound.now) {
        return Err(DispatchError::Unauthorized {
            kind: MessageKind::FileChunk,
            reason: "invalid file token",
        });
    }
    // Undecodable data is not ACKed, so the sender retransmits it.
    let payload = match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(file = %file_id, chunk = chunk_index, error = %e, "bad chunk data");
            return Ok(());
        }
    };
    let ack_key = chunk_ack_key(&file_id, chunk_index);
    let Some(transfer) = node.files.transfers.get_mut(&file_id) else {
        // Finished or never accepted: stop the sender's retries.
        node.push_ack(out, &ack_key, inbound.source)?;
        return Ok(());
    };
    if transfer.from != from {
        return Ok(());
    }
    let inserted = transfer.insert(chunk_index, total_chunks, payload, inbound.now);
    let complete = transfer.is_complete();
    match inserted {
        ChunkInsert::Stored | ChunkInsert::Duplicate => {
            node.push_ack(out, &ack_key, inbound.source)?;
        }
        ChunkInsert::OutOfRange => return Ok(()),
    }
    if inserted == ChunkInsert::Stored && complete {
        if let Some(transfer) = node.files.transfers.remove(&file_id) {
            node.complete_transfer(out, transfer, inbound.source, inbound.now)?;
        }
    }
    Ok(())
}

pub(crate) fn handle_received(
    node: &mut Node,
    inbound: Inbound,
    out: &mut Vec<OutboundAction>,
) -> Result<(), DispatchError> {
    let Message::FileReceived {
        from, to, file_id, ..
    } = inbound.message
    else {
        return Ok(());
    };
    if to != node.profile.id {
        return Ok(());
    }
    // Only the first receipt for a streamed file counts. Empty files were reported at offer time.
    if !node
        .files
        .awaiting_receipt
        .get(&file_id)
        .is_some_and(|(peer, _)| *peer == from)
    {
        return Ok(());
    }
    node.files.awaiting_receipt.remove(&file_id);
    tracing::info!(file = %file_id, by = %from, "file delivered");
    out.push(OutboundAction::Notify(Event::FileDelivered { file_id, to: from }));
    Ok(())
}
