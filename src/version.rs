use crate::weak_error;
use itertools::Itertools;
use once_cell::sync;
use regex::Regex;
use strum_macros::{Display, EnumIter};

/// Raw interpreter version, before it is checked against the supported table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTag {
    pub major: u8,
    pub minor: u8,
}

impl VersionTag {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parse a version from strings returned by `Py_GetVersion`, like:
    /// "3.8.10 (default, Nov 22 2023, 10:22:35) \n[GCC 9.4.0]".
    ///
    /// String must hold at least "X.Y" with a single digit major part.
    pub fn parse(s: &str) -> Option<Self> {
        static V_RE: sync::Lazy<Regex> =
            sync::Lazy::new(|| Regex::new(r"^(\d)\.(\d+)").expect("must compile"));

        if s.len() < 3 {
            return None;
        }
        let (_, [major, minor]) = V_RE.captures(s).map(|c| c.extract())?;
        let major = weak_error!(major.parse::<u8>())?;
        let minor = weak_error!(minor.parse::<u8>())?;
        Some(VersionTag { major, minor })
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Supported interpreter versions.
///
/// Discriminant is the number written to the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[repr(i32)]
pub enum RuntimeVersion {
    #[strum(serialize = "2.5")]
    V2_5 = 0x0205,
    #[strum(serialize = "2.6")]
    V2_6 = 0x0206,
    #[strum(serialize = "2.7")]
    V2_7 = 0x0207,
    #[strum(serialize = "3.0")]
    V3_0 = 0x0300,
    #[strum(serialize = "3.1")]
    V3_1 = 0x0301,
    #[strum(serialize = "3.2")]
    V3_2 = 0x0302,
    #[strum(serialize = "3.3")]
    V3_3 = 0x0303,
    #[strum(serialize = "3.4")]
    V3_4 = 0x0304,
    #[strum(serialize = "3.5")]
    V3_5 = 0x0305,
    #[strum(serialize = "3.6")]
    V3_6 = 0x0306,
    #[strum(serialize = "3.7")]
    V3_7 = 0x0307,
    #[strum(serialize = "3.8")]
    V3_8 = 0x0308,
    #[strum(serialize = "3.9")]
    V3_9 = 0x0309,
    #[strum(serialize = "3.10")]
    V3_10 = 0x0310,
}

/// Supported version table, in ascending order.
static SUPPORTED_PYTHON: &[(VersionTag, RuntimeVersion)] = &[
    (VersionTag::new(2, 5), RuntimeVersion::V2_5),
    (VersionTag::new(2, 6), RuntimeVersion::V2_6),
    (VersionTag::new(2, 7), RuntimeVersion::V2_7),
    (VersionTag::new(3, 0), RuntimeVersion::V3_0),
    (VersionTag::new(3, 1), RuntimeVersion::V3_1),
    (VersionTag::new(3, 2), RuntimeVersion::V3_2),
    (VersionTag::new(3, 3), RuntimeVersion::V3_3),
    (VersionTag::new(3, 4), RuntimeVersion::V3_4),
    (VersionTag::new(3, 5), RuntimeVersion::V3_5),
    (VersionTag::new(3, 6), RuntimeVersion::V3_6),
    (VersionTag::new(3, 7), RuntimeVersion::V3_7),
    (VersionTag::new(3, 8), RuntimeVersion::V3_8),
    (VersionTag::new(3, 9), RuntimeVersion::V3_9),
    (VersionTag::new(3, 10), RuntimeVersion::V3_10),
];

pub fn supported_versions_to_string() -> String {
    format!(
        "[{}]",
        SUPPORTED_PYTHON.iter().map(|(tag, _)| tag.to_string()).join(", ")
    )
}

impl RuntimeVersion {
    /// Return a supported version for a tag, `None` if tag is out of the table.
    pub fn from_tag(tag: VersionTag) -> Option<Self> {
        SUPPORTED_PYTHON
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| *v)
    }

    pub fn tag(self) -> VersionTag {
        SUPPORTED_PYTHON
            .iter()
            .find(|(_, v)| *v == self)
            .map(|(t, _)| *t)
            .unwrap_or(VersionTag::new(0, 0))
    }

    /// Number reported through the status channel.
    pub fn wire(self) -> i32 {
        self as i32
    }

    pub fn is_py3(self) -> bool {
        self >= RuntimeVersion::V3_0
    }

    /// `Py_AddPendingCall` may be called from a thread that does not hold the GIL.
    pub fn thread_safe_pending_calls(self) -> bool {
        self >= RuntimeVersion::V2_7 && self != RuntimeVersion::V3_0
    }

    /// `PyEval_InitThreads` asserts a current thread state.
    pub fn needs_thread_state_for_init(self) -> bool {
        self >= RuntimeVersion::V3_4
    }

    /// Initialization happens under `PyGILState_Ensure`, lock released by `PyEval_SaveThread`.
    pub fn gil_state_init(self) -> bool {
        self >= RuntimeVersion::V3_2
    }

    /// `sys.setswitchinterval` replaced `sys.setcheckinterval`.
    pub fn has_switch_interval(self) -> bool {
        self >= RuntimeVersion::V3_2
    }

    /// PEP 393 flexible string representation.
    pub fn has_compact_unicode(self) -> bool {
        self >= RuntimeVersion::V3_3
    }

    /// PEP 523 frame evaluation hook with a thread state argument.
    pub fn has_eval_frame_hook(self) -> bool {
        self >= RuntimeVersion::V3_9
    }

    /// Oldest version the attach sequence accepts.
    pub fn attachable(self) -> bool {
        self >= RuntimeVersion::V2_6
    }
}
