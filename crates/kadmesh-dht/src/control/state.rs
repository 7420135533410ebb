//! Routing state export and import
//!
//! Layout: `b"KDST"`, a format version byte, the body length as a
//! big-endian `u32`, then the bincode body. The body holds the exporting
//! node's id and its best contacts, each with the number of seconds it has
//! been known alive.

use super::DhtControl;
use crate::contact::Contact;
use crate::node_id::NodeId;
use crate::routing::RoutedContact;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Instant;

/// State file magic
pub const STATE_MAGIC: &[u8; 4] = b"KDST";

/// Current format version
pub const STATE_VERSION: u8 = 1;

/// Largest body accepted on import
pub const MAX_STATE_BYTES: u32 = 1024 * 1024;

/// State export and import errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a state file
    #[error("Bad state magic")]
    BadMagic,

    /// Written by an unknown format version
    #[error("Unsupported state version {0}")]
    UnsupportedVersion(u8),

    /// Body larger than [`MAX_STATE_BYTES`]
    #[error("State body of {0} bytes exceeds limit")]
    TooLarge(u32),

    /// Body could not be encoded or decoded
    #[error("State codec error: {0}")]
    Codec(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedContact {
    contact: Contact,
    alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedState {
    local_id: NodeId,
    contacts: Vec<ExportedContact>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(u64::from(MAX_STATE_BYTES))
        .with_fixint_encoding()
}

/// Export priority: imported contacts since seen alive, then other alive
/// contacts by time alive, then imported contacts that have not failed,
/// then the rest
fn export_rank(entry: &RoutedContact, imported: bool) -> u8 {
    match (imported, entry.alive) {
        (true, true) => 0,
        (false, true) => 1,
        (true, false) if entry.fails == 0 => 2,
        _ => 3,
    }
}

impl DhtControl {
    /// Write up to `max_contacts` of the best known contacts to `writer`;
    /// returns how many were written
    ///
    /// # Errors
    ///
    /// Returns `StateError` if encoding or writing fails
    pub fn export_state<W: Write>(&self, writer: &mut W, max_contacts: usize) -> Result<usize, StateError> {
        let now = Instant::now();
        let mut ranked: Vec<(u8, u64, Contact)> = {
            let router = self.router();
            router
                .entries()
                .map(|entry| {
                    let alive_secs = entry
                        .first_alive
                        .map_or(0, |at| now.saturating_duration_since(at).as_secs());
                    (
                        export_rank(entry, router.was_imported(&entry.contact.id)),
                        alive_secs,
                        entry.contact.clone(),
                    )
                })
                .collect()
        };
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        ranked.truncate(max_contacts);

        let state = ExportedState {
            local_id: self.local_id,
            contacts: ranked
                .into_iter()
                .map(|(_, alive_secs, contact)| ExportedContact {
                    contact,
                    alive_secs,
                })
                .collect(),
        };
        let body = codec()
            .serialize(&state)
            .map_err(|e| StateError::Codec(e.to_string()))?;
        let len = u32::try_from(body.len()).map_err(|_| StateError::TooLarge(u32::MAX))?;

        writer.write_all(STATE_MAGIC)?;
        writer.write_all(&[STATE_VERSION])?;
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(&body)?;
        writer.flush()?;
        tracing::debug!("Exported {} contacts", state.contacts.len());
        Ok(state.contacts.len())
    }

    /// Seed the routing table from a stream written by
    /// [`DhtControl::export_state`]; returns the number of contacts read
    ///
    /// # Errors
    ///
    /// Returns `StateError` for a foreign, unsupported, oversized or
    /// corrupt stream
    pub fn import_state<R: Read>(&self, reader: &mut R) -> Result<usize, StateError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version[0]));
        }
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len);
        if len > MAX_STATE_BYTES {
            return Err(StateError::TooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body)?;

        let state: ExportedState = codec()
            .deserialize(&body)
            .map_err(|e| StateError::Codec(e.to_string()))?;

        let mut router = self.router();
        for exported in &state.contacts {
            let id = exported.contact.id;
            router.contact_seen(exported.contact.clone(), false);
            router.mark_imported(id);
        }
        tracing::info!(
            "Imported {} contacts exported by {}",
            state.contacts.len(),
            state.local_id
        );
        Ok(state.contacts.len())
    }
}
