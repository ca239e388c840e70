//! Identity scheme for images and containers.
//!
//! Ids are `img_<n>` / `ps_<n>` with n drawn from a deliberately narrow
//! integer range, so collisions are observable and handled rather than rare.
//! The store listing is the sole authority on whether an id is taken.

use rand::Rng;

use crate::errors::{BockerError, BockerResult};
use crate::store::Store;

/// Inclusive bounds of the numeric id token.
pub const ID_MIN: u32 = 42002;
pub const ID_MAX: u32 = 42254;

/// Bound on regeneration attempts before surfacing `IdCollision`.
pub const MAX_ID_ATTEMPTS: usize = 10;

/// The two kinds of store entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Image,
    Container,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Image => "img_",
            EntityKind::Container => "ps_",
        }
    }
}

/// Generate a fresh id of the given kind. Uniqueness is not checked here;
/// use [`allocate`] for collision-checked allocation.
pub fn new_id(kind: EntityKind) -> String {
    let n: u32 = rand::rng().random_range(ID_MIN..=ID_MAX);
    format!("{}{}", kind.prefix(), n)
}

/// Classify an id by prefix, rejecting anything with a malformed token.
pub fn kind_of(id: &str) -> Option<EntityKind> {
    for kind in [EntityKind::Image, EntityKind::Container] {
        if let Some(rest) = id.strip_prefix(kind.prefix()) {
            if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                return Some(kind);
            }
        }
    }
    None
}

/// The numeric token of a well-formed id.
pub fn numeric_token(id: &str) -> Option<u32> {
    let kind = kind_of(id)?;
    id.strip_prefix(kind.prefix())?.parse().ok()
}

/// Allocate an id that is not yet present in the store.
///
/// Regenerates on collision up to [`MAX_ID_ATTEMPTS`] times; the bound makes
/// exhaustion of the narrow id range a defined outcome instead of a hang.
pub fn allocate(store: &Store, kind: EntityKind) -> BockerResult<String> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = new_id(kind);
        if !store.exists(&id) {
            return Ok(id);
        }
        tracing::debug!(%id, "id collision, regenerating");
    }
    Err(BockerError::IdCollision(MAX_ID_ATTEMPTS))
}
