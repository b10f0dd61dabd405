//! Row-level security predicate for every store read.
//!
//! An [`AccessFilter`] is built once per request from the caller's identity
//! and handed to every store operation, which composes it (logical AND) with
//! the search-specific predicate. Filtering happens *inside* the store query,
//! never as a post-fetch step; [`AccessFilter::matches`] exists for pointwise
//! checks against records already in memory (pre-fetch validation, the
//! in-memory store) and is the same predicate.
//!
//! A document is visible iff the caller is its owner, the caller is an admin,
//! the document is public, the caller's id or label is in `shared_with`, or
//! any caller group intersects `group_ids`.

use std::collections::BTreeSet;

use crate::models::{AccessControl, Caller};

/// The predicate a caller's identity induces over stored records.
#[derive(Debug, Clone)]
pub enum AccessFilter {
    /// Admins bypass row-level security: matches every record.
    All,
    /// Non-admin caller: OR of owner / public / shared / group conditions.
    Caller {
        id: String,
        label: String,
        groups: Vec<String>,
    },
}

impl AccessFilter {
    /// Build the filter for a caller.
    pub fn for_caller(caller: &Caller) -> Self {
        if caller.is_admin {
            AccessFilter::All
        } else {
            AccessFilter::Caller {
                id: caller.id.clone(),
                label: caller.label.clone(),
                groups: caller.groups.clone(),
            }
        }
    }

    /// Pointwise visibility check for a single in-memory record.
    ///
    /// Equivalent to the predicate the store applies at query time; not a
    /// substitute for filtering at the store.
    pub fn matches(&self, access: &AccessControl) -> bool {
        match self {
            AccessFilter::All => true,
            AccessFilter::Caller { id, label, groups } => {
                if !id.is_empty() && access.owner_id == *id {
                    return true;
                }
                if access.is_public {
                    return true;
                }
                if (!id.is_empty() && access.shared_with.contains(id))
                    || (!label.is_empty() && access.shared_with.contains(label))
                {
                    return true;
                }
                groups.iter().any(|g| access.group_ids.contains(g))
            }
        }
    }
}

/// An incremental sharing grant. Fields merge into the existing access
/// record; nothing is ever removed by a grant.
#[derive(Debug, Clone, Default)]
pub struct SharingGrant {
    /// `Some(value)` overwrites the public flag; `None` leaves it alone.
    pub is_public: Option<bool>,
    /// Identity strings to add to `shared_with`.
    pub shared_with: BTreeSet<String>,
    /// Groups to add to `group_ids`.
    pub group_ids: BTreeSet<String>,
}

/// Merge a sharing grant into an access record.
///
/// Pure; persisting the result (document row plus every denormalized chunk
/// copy) is the store's job.
pub fn apply_sharing(access: &AccessControl, grant: &SharingGrant) -> AccessControl {
    let mut updated = access.clone();
    if let Some(public) = grant.is_public {
        updated.is_public = public;
    }
    updated.shared_with.extend(grant.shared_with.iter().cloned());
    updated.group_ids.extend(grant.group_ids.iter().cloned());
    updated
}
