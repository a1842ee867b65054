//! Identifier space, paths and the protocol result taxonomy.
//!
//! Every entity in the data model is addressed by up to four unsigned
//! integers in `[0, 65535]`:
//!
//! ```txt
//!     /<object>/<instance>/<resource>/<resource-instance>
//!        /3    /    0    /    9     /       0
//! ```
//!
//! The shortest valid prefix selects an Object, Object Instance, Resource or
//! Resource Instance. Absent trailing segments are modelled as `None` rather
//! than the wire-level `-1` sentinel.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

pub type ObjectId = u16;
pub type InstanceId = u16;
pub type ResourceId = u16;
pub type ResourceInstanceId = u16;

/// OMA-registered object ids the runtime treats specially.
pub const SECURITY_OBJECT: ObjectId = 0;
pub const SERVER_OBJECT: ObjectId = 1;
pub const DEVICE_OBJECT: ObjectId = 3;

/// How deep into the tree a [`Path`] reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathDepth {
    Root,
    Object,
    ObjectInstance,
    Resource,
    ResourceInstance,
}

/// An address into the four-level object tree.
///
/// Later segments may be absent; a segment is only meaningful when every
/// segment before it is present, which the constructors enforce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    pub object: Option<ObjectId>,
    pub instance: Option<InstanceId>,
    pub resource: Option<ResourceId>,
    pub resource_instance: Option<ResourceInstanceId>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn object(object: ObjectId) -> Self {
        Self {
            object: Some(object),
            ..Self::default()
        }
    }

    pub fn instance(object: ObjectId, instance: InstanceId) -> Self {
        Self {
            object: Some(object),
            instance: Some(instance),
            ..Self::default()
        }
    }

    pub fn resource(object: ObjectId, instance: InstanceId, resource: ResourceId) -> Self {
        Self {
            object: Some(object),
            instance: Some(instance),
            resource: Some(resource),
            ..Self::default()
        }
    }

    pub fn resource_instance(
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        resource_instance: ResourceInstanceId,
    ) -> Self {
        Self {
            object: Some(object),
            instance: Some(instance),
            resource: Some(resource),
            resource_instance: Some(resource_instance),
        }
    }

    pub fn depth(&self) -> PathDepth {
        match (
            self.object,
            self.instance,
            self.resource,
            self.resource_instance,
        ) {
            (None, ..) => PathDepth::Root,
            (Some(_), None, ..) => PathDepth::Object,
            (Some(_), Some(_), None, _) => PathDepth::ObjectInstance,
            (Some(_), Some(_), Some(_), None) => PathDepth::Resource,
            (Some(_), Some(_), Some(_), Some(_)) => PathDepth::ResourceInstance,
        }
    }

    /// Strip the last present segment, e.g. `/3/0/9` -> `/3/0`.
    pub fn parent(&self) -> Option<Self> {
        let mut parent = *self;
        if parent.resource_instance.take().is_some() {
            return Some(parent);
        }
        if parent.resource.take().is_some() {
            return Some(parent);
        }
        if parent.instance.take().is_some() {
            return Some(parent);
        }
        if parent.object.take().is_some() {
            return Some(parent);
        }
        None
    }

    /// Whether `self` is `other` or one of its ancestors.
    ///
    /// `/3` covers `/3/0/9`; `/3/0/9` does not cover `/3/0`.
    pub fn covers(&self, other: &Path) -> bool {
        fn segment_covers(mine: Option<u16>, theirs: Option<u16>) -> bool {
            match (mine, theirs) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            }
        }

        // Absent segments below an absent one are absent too, so checking all
        // four independently is equivalent to a prefix comparison.
        segment_covers(self.object, other.object)
            && segment_covers(self.instance, other.instance)
            && segment_covers(self.resource, other.resource)
            && segment_covers(self.resource_instance, other.resource_instance)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut segments = [
            self.object,
            self.instance,
            self.resource,
            self.resource_instance,
        ]
        .into_iter()
        .flatten()
        .peekable();

        if segments.peek().is_none() {
            return "/".fmt(f);
        }
        for segment in segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathParseError {
    #[error("path must start with '/', found {0:?}")]
    MissingLeadingSlash(String),
    #[error("path segment {0:?} is not an id in 0..=65535")]
    InvalidSegment(String),
    #[error("path has more than four segments")]
    TooDeep,
}

impl FromStr for Path {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "/" || trimmed.is_empty() {
            return Ok(Path::root());
        }
        let rest = trimmed
            .strip_prefix('/')
            .ok_or_else(|| PathParseError::MissingLeadingSlash(s.to_owned()))?;

        let mut segments = [None; 4];
        let mut count = 0;
        for raw in rest.trim_end_matches('/').split('/') {
            if count == segments.len() {
                return Err(PathParseError::TooDeep);
            }
            let id: u16 = raw
                .parse()
                .map_err(|_| PathParseError::InvalidSegment(raw.to_owned()))?;
            segments[count] = Some(id);
            count += 1;
        }

        Ok(Path {
            object: segments[0],
            instance: segments[1],
            resource: segments[2],
            resource_instance: segments[3],
        })
    }
}

/// Operations a resource definition permits.
///
/// `Execute` is mutually exclusive with `Read`/`Write` at the definition
/// level, which the closed set of variants guarantees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Operations {
    #[default]
    None,
    Read,
    Write,
    ReadWrite,
    Execute,
}

impl Operations {
    pub fn is_readable(self) -> bool {
        matches!(self, Operations::Read | Operations::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Operations::Write | Operations::ReadWrite)
    }

    pub fn is_executable(self) -> bool {
        matches!(self, Operations::Execute)
    }
}

impl Display for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operations::None => "None",
            Operations::Read => "Read",
            Operations::Write => "Write",
            Operations::ReadWrite => "ReadWrite",
            Operations::Execute => "Execute",
        }
        .fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no operation set is named {0:?}")]
pub struct UnknownOperations(pub String);

impl FromStr for Operations {
    type Err = UnknownOperations;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "None" => Operations::None,
            "R" | "Read" => Operations::Read,
            "W" | "Write" => Operations::Write,
            "RW" | "ReadWrite" => Operations::ReadWrite,
            "E" | "Execute" => Operations::Execute,
            other => return Err(UnknownOperations(other.to_owned())),
        })
    }
}

/// The authenticated role of a request source, used for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// The local application talking over IPC.
    Client,
    /// A remote LWM2M management server.
    Server,
    /// A remote LWM2M bootstrap server.
    BootstrapServer,
}

/// Protocol-level completion codes, surfaced as CoAP response codes and as
/// `<Error>` strings on the IPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    SuccessCreated,
    SuccessDeleted,
    SuccessChanged,
    SuccessContent,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    PayloadTooLarge,
    UnsupportedContentFormat,
    TooManyRequests,
    InternalError,
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        use ResultCode::*;
        matches!(
            self,
            Success | SuccessCreated | SuccessDeleted | SuccessChanged | SuccessContent
        )
    }

    /// The RFC 7252 response code, `class << 5 | detail`.
    pub fn coap_code(self) -> u8 {
        use ResultCode::*;
        let (class, detail) = match self {
            Success => (2, 0),
            SuccessCreated => (2, 1),
            SuccessDeleted => (2, 2),
            SuccessChanged => (2, 4),
            SuccessContent => (2, 5),
            BadRequest => (4, 0),
            Unauthorized => (4, 1),
            Forbidden => (4, 3),
            NotFound => (4, 4),
            MethodNotAllowed => (4, 5),
            PayloadTooLarge => (4, 13),
            UnsupportedContentFormat => (4, 15),
            TooManyRequests => (4, 29),
            InternalError => (5, 0),
        };
        (class << 5) | detail
    }

    /// The enum name as carried in IPC `<Error>` fields.
    pub fn name(self) -> &'static str {
        use ResultCode::*;
        match self {
            Success => "Success",
            SuccessCreated => "SuccessCreated",
            SuccessDeleted => "SuccessDeleted",
            SuccessChanged => "SuccessChanged",
            SuccessContent => "SuccessContent",
            BadRequest => "BadRequest",
            Unauthorized => "Unauthorized",
            Forbidden => "Forbidden",
            NotFound => "NotFound",
            MethodNotAllowed => "MethodNotAllowed",
            PayloadTooLarge => "PayloadTooLarge",
            UnsupportedContentFormat => "UnsupportedContentFormat",
            TooManyRequests => "TooManyRequests",
            InternalError => "InternalError",
        }
    }
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_paths() {
        assert_eq!("/".parse::<Path>().unwrap(), Path::root());
        assert_eq!("/3".parse::<Path>().unwrap(), Path::object(3));
        assert_eq!("/3/0".parse::<Path>().unwrap(), Path::instance(3, 0));
        assert_eq!("/3/0/9".parse::<Path>().unwrap(), Path::resource(3, 0, 9));
        assert_eq!(
            "/3/0/9/1".parse::<Path>().unwrap(),
            Path::resource_instance(3, 0, 9, 1)
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            "3/0".parse::<Path>(),
            Err(PathParseError::MissingLeadingSlash("3/0".to_owned()))
        );
        assert_eq!(
            "/3/x".parse::<Path>(),
            Err(PathParseError::InvalidSegment("x".to_owned()))
        );
        assert_eq!(
            "/70000".parse::<Path>(),
            Err(PathParseError::InvalidSegment("70000".to_owned()))
        );
        assert_eq!("/1/2/3/4/5".parse::<Path>(), Err(PathParseError::TooDeep));
    }

    #[test]
    fn display_round_trips() {
        for text in ["/", "/3", "/3/0", "/3/0/9", "/3/0/9/1"] {
            let path: Path = text.parse().unwrap();
            assert_eq!(path.to_string(), text);
        }
    }

    #[test]
    fn coverage_is_prefix_based() {
        let object = Path::object(3);
        let resource = Path::resource(3, 0, 9);

        assert!(Path::root().covers(&resource));
        assert!(object.covers(&resource));
        assert!(resource.covers(&resource));
        assert!(!resource.covers(&object));
        assert!(!Path::object(4).covers(&resource));
    }

    #[test]
    fn result_codes_map_to_coap() {
        assert_eq!(ResultCode::SuccessContent.coap_code(), 0x45);
        assert_eq!(ResultCode::SuccessChanged.coap_code(), 0x44);
        assert_eq!(ResultCode::NotFound.coap_code(), 0x84);
        assert_eq!(ResultCode::MethodNotAllowed.coap_code(), 0x85);
        assert_eq!(ResultCode::InternalError.coap_code(), 0xA0);
    }
}
