//! Disk image operation status.

use serde::{Deserialize, Serialize};

/// Status of a disk image operation.
///
/// ```text
/// factory → Unknown ─prepare ok─→ InProgress ─run…─→ Created | Resized
///                   └prepare err─→ Failed | NotEnoughSpace | DoesNotExist
/// ```
///
/// Terminal values never change again for the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskImageStatus {
    /// Not yet prepared, or a resize backend could not tell.
    Unknown,

    /// Preparation succeeded; `run` has more work to do.
    InProgress,

    /// Image created, exported or imported.
    Created,

    /// Disk resized.
    Resized,

    /// Failed for a reason other than the ones below.
    Failed,

    /// The target filesystem ran out of space.
    NotEnoughSpace,

    /// The source does not exist.
    DoesNotExist,
}

impl DiskImageStatus {
    /// Check if the operation is done (successfully or not).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DiskImageStatus::Unknown | DiskImageStatus::InProgress)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DiskImageStatus::Created | DiskImageStatus::Resized)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DiskImageStatus::Failed
                | DiskImageStatus::NotEnoughSpace
                | DiskImageStatus::DoesNotExist
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskImageStatus::Unknown => "UNKNOWN",
            DiskImageStatus::InProgress => "IN_PROGRESS",
            DiskImageStatus::Created => "CREATED",
            DiskImageStatus::Resized => "RESIZED",
            DiskImageStatus::Failed => "FAILED",
            DiskImageStatus::NotEnoughSpace => "NOT_ENOUGH_SPACE",
            DiskImageStatus::DoesNotExist => "DOES_NOT_EXIST",
        }
    }
}

impl std::str::FromStr for DiskImageStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(DiskImageStatus::Unknown),
            "IN_PROGRESS" => Ok(DiskImageStatus::InProgress),
            "CREATED" => Ok(DiskImageStatus::Created),
            "RESIZED" => Ok(DiskImageStatus::Resized),
            "FAILED" => Ok(DiskImageStatus::Failed),
            "NOT_ENOUGH_SPACE" => Ok(DiskImageStatus::NotEnoughSpace),
            "DOES_NOT_EXIST" => Ok(DiskImageStatus::DoesNotExist),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for DiskImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
