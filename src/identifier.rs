//! Public slug and username allocation for business listings.
//!
//! Reservation is check-then-act: `reserve_*` only reads the store. The
//! `assign_*` variants write the chosen candidate through the store's
//! uniqueness constraint and advance to the next candidate when a concurrent
//! writer won the race.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::error::ValidationError;
use crate::model::ListingId;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no free identifier for '{base}' after {attempts} candidates, choose a different name")]
    AllocationExhausted { base: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Slug,
    Username,
}

impl Kind {
    fn candidate(self, base: &str, attempt: u32, max_len: usize) -> String {
        if attempt == 0 {
            return truncate(base, max_len).to_string();
        }
        let suffix = match self {
            Kind::Slug => format!("-{attempt}"),
            Kind::Username => attempt.to_string(),
        };
        let stem = truncate(base, max_len.saturating_sub(suffix.len()));
        let stem = match self {
            Kind::Slug => stem.trim_end_matches('-'),
            Kind::Username => stem,
        };
        format!("{stem}{suffix}")
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    // identifiers are ASCII after normalization
    &s[..s.len().min(max_len)]
}

/// Lowercase ASCII slug with runs of anything else collapsed into one `-`.
///
/// `"Royal  Prints & Co."` becomes `"royal-prints-co"`.
pub fn slugify(base: &str) -> String {
    let mut slug = String::with_capacity(base.len());
    let mut pending_separator = false;

    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

/// Lowercase ASCII letters, digits and underscores; everything else is dropped.
pub fn normalize_username(base: &str) -> String {
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub struct IdentifierAllocator<S> {
    store: Arc<S>,
    config: LedgerConfig,
}

impl<S: Store> IdentifierAllocator<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Find a slug unused by any listing other than `current`.
    ///
    /// Tries `base`, then `base-1`, `base-2`, ... until one is free.
    pub async fn reserve_slug(
        &self,
        base: &str,
        current: Option<ListingId>,
    ) -> Result<String, IdentifierError> {
        let slug = slugify(base);
        if slug.is_empty() {
            return Err(ValidationError::EmptyIdentifier {
                base: base.to_string(),
            }
            .into());
        }

        let mut attempt = 0;
        loop {
            let candidate = Kind::Slug.candidate(&slug, attempt, usize::MAX);
            if self.is_free(Kind::Slug, &candidate, current).await? {
                debug!(base, slug = %candidate, attempt, "slug reserved");
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    /// Find a username unused (ignoring case) by any listing other than `current`.
    ///
    /// Reserved words are skipped even when free. Gives up after
    /// `identifier_attempts` candidates.
    pub async fn reserve_username(
        &self,
        base: &str,
        current: Option<ListingId>,
    ) -> Result<String, IdentifierError> {
        let username = self.validated_username(base)?;

        for attempt in 0..self.config.identifier_attempts {
            let candidate =
                Kind::Username.candidate(&username, attempt, self.config.username_max_len);
            if self.config.is_reserved(&candidate)
                || candidate.len() < self.config.username_min_len
            {
                continue;
            }
            if self.is_free(Kind::Username, &candidate, current).await? {
                debug!(base, username = %candidate, attempt, "username reserved");
                return Ok(candidate);
            }
        }

        Err(IdentifierError::AllocationExhausted {
            base: base.to_string(),
            attempts: self.config.identifier_attempts,
        })
    }

    /// Reserve a slug and write it on `listing`, retrying on a lost race.
    pub async fn assign_slug(
        &self,
        listing: ListingId,
        base: &str,
    ) -> Result<String, IdentifierError> {
        for _ in 0..self.config.identifier_attempts {
            let slug = self.reserve_slug(base, Some(listing)).await?;
            match self.store.set_listing_slug(listing, &slug).await {
                Ok(()) => {
                    info!(listing, slug = %slug, "slug assigned");
                    return Ok(slug);
                }
                Err(StoreError::UniqueViolation { .. }) => {
                    debug!(listing, slug = %slug, "slug claimed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IdentifierError::AllocationExhausted {
            base: base.to_string(),
            attempts: self.config.identifier_attempts,
        })
    }

    /// Reserve a username and write it on `listing`, retrying on a lost race.
    pub async fn assign_username(
        &self,
        listing: ListingId,
        base: &str,
    ) -> Result<String, IdentifierError> {
        for _ in 0..self.config.identifier_attempts {
            let username = self.reserve_username(base, Some(listing)).await?;
            match self.store.set_listing_username(listing, &username).await {
                Ok(()) => {
                    info!(listing, username = %username, "username assigned");
                    return Ok(username);
                }
                Err(StoreError::UniqueViolation { .. }) => {
                    debug!(listing, username = %username, "username claimed concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(IdentifierError::AllocationExhausted {
            base: base.to_string(),
            attempts: self.config.identifier_attempts,
        })
    }

    fn validated_username(&self, base: &str) -> Result<String, ValidationError> {
        let username = normalize_username(base);
        if username.is_empty() {
            return Err(ValidationError::EmptyIdentifier {
                base: base.to_string(),
            });
        }
        if username.len() < self.config.username_min_len {
            return Err(ValidationError::IdentifierTooShort {
                candidate: username,
                min: self.config.username_min_len,
            });
        }
        Ok(username)
    }

    async fn is_free(
        &self,
        kind: Kind,
        candidate: &str,
        current: Option<ListingId>,
    ) -> Result<bool, StoreError> {
        let holder = match kind {
            Kind::Slug => self.store.listing_by_slug(candidate).await?,
            Kind::Username => self.store.listing_by_username(candidate).await?,
        };
        Ok(match holder {
            None => true,
            Some(listing) => Some(listing.id) == current,
        })
    }
}
