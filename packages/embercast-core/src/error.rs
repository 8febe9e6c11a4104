//! Centralized error types for the Embercast core.
//!
//! Every tick handler returns a status rather than throwing; the error enum
//! here covers the conditions that surface past a single tick - admission
//! rejections, producer attach failures, and structural queue faults. Each
//! variant maps to a machine-readable code and an HTTP status so front ends
//! can answer clients without inspecting variants.

use thiserror::Error;

/// Application-wide error type for the streaming core.
#[derive(Debug, Error)]
pub enum CastError {
    /// A producer tried to claim a mount that already has one.
    #[error("Mountpoint {0} in use")]
    MountInUse(String),

    /// The global source limit was reached during producer attach.
    #[error("too many streams connected (limit {0})")]
    TooManySources(usize),

    /// No format adapter claims the producer's content type.
    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),

    /// No live source exists for the requested mount or its fallback chain.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// The fallback chain exceeded the hop limit.
    #[error("Fallback through too many mountpoints on {0}")]
    FallbackTooDeep(String),

    /// Per-mount listener or bandwidth cap reached.
    ///
    /// `redirect` names the originally-requested mount a 403 redirect should
    /// point the client back at.
    #[error("mount {mount} is full")]
    Full {
        mount: String,
        redirect: Option<String>,
    },

    /// Admitting the listener would exceed the global bandwidth cap.
    #[error("server bandwidth limit reached for {mount}")]
    BandwidthExceeded {
        mount: String,
        redirect: Option<String>,
    },

    /// The same username is already attached and duplicates are disallowed.
    #[error("duplicate login on {0}")]
    DuplicateLogin(String),

    /// A queue bookkeeping invariant was violated; the source is dropped.
    #[error("queue state corrupt on {0}")]
    QueueCorrupt(String),

    /// Underlying socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CastError {
    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MountInUse(_) => "mount_in_use",
            Self::TooManySources(_) => "source_limit_reached",
            Self::UnsupportedContent(_) => "unsupported_content",
            Self::MountNotFound(_) => "mount_not_found",
            Self::FallbackTooDeep(_) => "fallback_too_deep",
            Self::Full { .. } => "mount_full",
            Self::BandwidthExceeded { .. } => "bandwidth_limit",
            Self::DuplicateLogin(_) => "duplicate_login",
            Self::QueueCorrupt(_) => "queue_corrupt",
            Self::Io(_) => "io_error",
        }
    }

    /// Maps the error to the HTTP status a front end should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MountNotFound(_) => 404,
            Self::Io(_) | Self::QueueCorrupt(_) => 500,
            _ => 403,
        }
    }

    /// The mount a 403 redirect should point at, when one applies.
    pub fn redirect_mount(&self) -> Option<&str> {
        match self {
            Self::Full { redirect, .. } | Self::BandwidthExceeded { redirect, .. } => {
                redirect.as_deref()
            }
            _ => None,
        }
    }
}

/// Convenient Result alias for core operations.
pub type CastResult<T> = Result<T, CastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_403() {
        let err = CastError::Full {
            mount: "/live".into(),
            redirect: Some("/live".into()),
        };
        assert_eq!(err.http_status(), 403);
        assert_eq!(err.code(), "mount_full");
        assert_eq!(err.redirect_mount(), Some("/live"));
    }

    #[test]
    fn missing_mount_maps_to_404() {
        let err = CastError::MountNotFound("/gone".into());
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.redirect_mount(), None);
    }
}
