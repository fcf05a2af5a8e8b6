//! Who may search or upload into which events.

use rand::Rng;
use std::collections::HashSet;

use crate::context::RequestContext;
use crate::db::{Database, Event, EventState};
use crate::error::{AccessDenial, Error, Result};

pub const ACCESS_CODE_LEN: usize = 8;

/// No 0/O, 1/I/L: codes get read aloud and typed from printouts
pub const ACCESS_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

const MAX_CODE_ATTEMPTS: usize = 16;

/// Events a caller may search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub event_ids: HashSet<i64>,
}

impl Scope {
    pub fn single(event_id: i64) -> Self {
        Self {
            event_ids: [event_id].into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_ids.is_empty()
    }
}

/// Trim and uppercase; `ValidationError` unless exactly 8 alphanumerics.
pub fn canonicalize_code(code: &str) -> Result<String> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != ACCESS_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::validation(format!(
            "access code must be {} letters or digits",
            ACCESS_CODE_LEN
        )));
    }
    Ok(code)
}

/// Resolve the searchable scope for a request.
///
/// An access code always takes the code path. Without one, an organizer
/// searches their own events (optionally narrowed to `event_id`).
pub fn resolve(
    db: &Database,
    ctx: &RequestContext,
    event_id: Option<i64>,
    access_code: Option<&str>,
) -> Result<Scope> {
    if let Some(code) = access_code {
        let event = event_for_code(db, code)?;
        if event_id.is_some_and(|id| id != event.id) {
            return Err(Error::AccessDenied(AccessDenial::InvalidCode));
        }
        return Ok(Scope::single(event.id));
    }

    if let Some(identity) = ctx.organizer() {
        return match event_id {
            Some(event_id) => {
                owned_event(db, identity.user_id, event_id)?;
                Ok(Scope::single(event_id))
            }
            None => Ok(Scope {
                event_ids: db
                    .list_event_ids_for_owner(identity.user_id)?
                    .into_iter()
                    .collect(),
            }),
        };
    }

    Err(Error::validation("an access code is required"))
}

/// The published event behind an access code.
pub fn event_for_code(db: &Database, code: &str) -> Result<Event> {
    let code = canonicalize_code(code)?;
    let event = db
        .find_event_by_code(&code)?
        .ok_or(Error::AccessDenied(AccessDenial::InvalidCode))?;
    if event.state != EventState::Published {
        return Err(Error::AccessDenied(AccessDenial::EventNotPublished));
    }
    Ok(event)
}

/// The event, if the caller is an organizer who owns it.
///
/// Someone else's event is reported as missing rather than forbidden.
pub fn require_owned_event(db: &Database, ctx: &RequestContext, event_id: i64) -> Result<Event> {
    let identity = ctx
        .organizer()
        .ok_or(Error::AccessDenied(AccessDenial::NotOrganizer))?;
    owned_event(db, identity.user_id, event_id)
}

fn owned_event(db: &Database, owner_id: i64, event_id: i64) -> Result<Event> {
    match db.get_event(event_id)? {
        Some(event) if event.owner_id == owner_id => Ok(event),
        _ => Err(Error::not_found(format!("event {}", event_id))),
    }
}

pub fn generate_access_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ACCESS_CODE_LEN)
        .map(|_| ACCESS_CODE_ALPHABET[rng.gen_range(0..ACCESS_CODE_ALPHABET.len())] as char)
        .collect()
}

/// A code no other event uses yet.
pub fn issue_unique_code(db: &Database) -> Result<String> {
    let mut rng = rand::thread_rng();
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = generate_access_code(&mut rng);
        if !db.access_code_exists(&code)? {
            return Ok(code);
        }
        tracing::debug!(attempt, "Access code collision, retrying");
    }
    Err(anyhow::anyhow!("No unique access code after {} attempts", MAX_CODE_ATTEMPTS).into())
}

/// Reserve upload bytes against the event quota.
///
/// Rejects iff `used + incoming > limit`; check and reservation are one
/// statement so concurrent uploads cannot overshoot.
pub fn reserve_quota(db: &Database, event_id: i64, incoming: u64, limit: u64) -> Result<()> {
    db.reserve_storage(event_id, incoming, limit).inspect_err(|e| {
        if let Error::QuotaExceeded { used, .. } = e {
            tracing::info!(event_id, used, incoming, limit, "Upload rejected by quota");
        }
    })
}
