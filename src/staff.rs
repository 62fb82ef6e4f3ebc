//! Staff detection
//!
//! A sender counts as staff when their handle contains the organisation
//! marker, case-insensitively. This is a naming convention, not a verified
//! role: anyone can pick a matching username. It sits behind a trait so a
//! real role lookup can replace it.

/// Decides whether a sender handle belongs to staff
pub trait StaffPredicate: Send + Sync {
    fn is_privileged(&self, handle: &str) -> bool;
}

/// Substring match on the organisation marker
#[derive(Debug, Clone)]
pub struct OrgMarker {
    marker: String,
}

impl OrgMarker {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.trim().to_lowercase(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl StaffPredicate for OrgMarker {
    fn is_privileged(&self, handle: &str) -> bool {
        if handle.is_empty() || self.marker.is_empty() {
            return false;
        }
        handle.to_lowercase().contains(&self.marker)
    }
}
