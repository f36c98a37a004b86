use crate::geom::Dim3;
use crate::types::{MethodFlags, Rank};

pub type Result<T> = std::result::Result<T, HaloError>;

#[derive(Debug, thiserror::Error)]
pub enum HaloError {
    #[error(
        "cannot partition global extent {global} into {rank_grid} rank grid x {gpu_grid} device grid"
    )]
    PartitionInfeasible {
        global: Dim3,
        rank_grid: Dim3,
        gpu_grid: Dim3,
    },

    #[error("no enabled method to {verb} for direction {dir} from sub-domain {sub_domain} (enabled: {flags:?})")]
    NoMethodAvailable {
        verb: &'static str,
        dir: Dim3,
        sub_domain: usize,
        flags: MethodFlags,
    },

    #[error("no local sub-domain bound to device slot {slot} on rank {rank}")]
    NoSuchDomain { slot: usize, rank: Rank },

    #[error("data handle {handle} out of range: {count} fields registered")]
    InvalidHandle { handle: usize, count: usize },

    #[error("domain already realized")]
    AlreadyRealized,

    #[error("exchange before realize")]
    NotRealized,

    #[error("device runtime error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("message layer error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("peer {rank} not reachable through the message layer")]
    UnknownPeer { rank: Rank },

    #[error("message size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("message layer request {0} is not outstanding")]
    UnknownRequest(u64),
}

impl HaloError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_infeasible_display() {
        let e = HaloError::PartitionInfeasible {
            global: Dim3::new(1, 1, 1),
            rank_grid: Dim3::new(4, 1, 1),
            gpu_grid: Dim3::new(1, 1, 1),
        };
        let s = e.to_string();
        assert!(s.contains("(1, 1, 1)"));
        assert!(s.contains("(4, 1, 1)"));
    }

    #[test]
    fn test_no_method_display() {
        let e = HaloError::NoMethodAvailable {
            verb: "send",
            dir: Dim3::new(1, 0, -1),
            sub_domain: 0,
            flags: MethodFlags::NONE,
        };
        assert!(e.to_string().contains("send"));
        assert!(e.to_string().contains("(1, 0, -1)"));
    }

    #[test]
    fn test_helper_constructors() {
        let e = HaloError::device("out of memory");
        assert!(e.to_string().contains("out of memory"));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let e = HaloError::transport_with_source("send failed", io);
        assert!(e.to_string().contains("send failed"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<HaloError> = vec![
            HaloError::PartitionInfeasible {
                global: Dim3::new(2, 2, 2),
                rank_grid: Dim3::new(3, 1, 1),
                gpu_grid: Dim3::new(1, 1, 1),
            },
            HaloError::NoMethodAvailable {
                verb: "recv",
                dir: Dim3::new(0, 1, 0),
                sub_domain: 1,
                flags: MethodFlags::COLOCATED,
            },
            HaloError::NoSuchDomain { slot: 2, rank: 0 },
            HaloError::InvalidHandle {
                handle: 5,
                count: 2,
            },
            HaloError::AlreadyRealized,
            HaloError::NotRealized,
            HaloError::device("x"),
            HaloError::transport("y"),
            HaloError::UnknownPeer { rank: 9 },
            HaloError::SizeMismatch {
                expected: 16,
                actual: 8,
            },
            HaloError::UnknownRequest(42),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
