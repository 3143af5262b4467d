//! Resource identifiers: folders, documents, canvases, and files living on
//! one relay. Kept as a tagged sum rather than a struct with optional
//! fields so callers can't probe for "is this a file" by checking which
//! field happens to be set.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("static uuid pattern compiles")
    })
}

/// True for a well-formed 5-group dash-separated UUID string.
pub fn is_uuid(s: &str) -> bool {
    uuid_re().is_match(s)
}

/// Heuristic from the source system: an id with more than five dash-groups
/// is almost certainly a leftover compound id (`relay-inner`) and must be
/// dropped rather than trusted as a bare resource id.
pub fn looks_like_compound_id(s: &str) -> bool {
    s.split('-').count() > 5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Folder,
    Document,
    Canvas,
    File,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Folder => "folder",
            ResourceKind::Document => "document",
            ResourceKind::Canvas => "canvas",
            ResourceKind::File => "file",
        };
        f.write_str(s)
    }
}

/// Sub-kind carried in filemeta for `File` resources. Collapses to
/// `ResourceKind::File` everywhere except display/extension classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSubKind {
    Generic,
    Image,
    Pdf,
    Audio,
    Video,
}

/// The metadata `type` string as it appears in filemeta, before being
/// mapped down to a `ResourceKind` + optional `FileSubKind`.
pub fn classify_metadata_type(type_str: &str) -> Option<(ResourceKind, Option<FileSubKind>)> {
    match type_str {
        "folder" => Some((ResourceKind::Folder, None)),
        "document" | "markdown" => Some((ResourceKind::Document, None)),
        "canvas" => Some((ResourceKind::Canvas, None)),
        "file" => Some((ResourceKind::File, Some(FileSubKind::Generic))),
        "image" => Some((ResourceKind::File, Some(FileSubKind::Image))),
        "pdf" => Some((ResourceKind::File, Some(FileSubKind::Pdf))),
        "audio" => Some((ResourceKind::File, Some(FileSubKind::Audio))),
        "video" => Some((ResourceKind::File, Some(FileSubKind::Video))),
        _ => None,
    }
}

/// A resource living on some relay. `relay_id` is carried alongside every
/// variant rather than folded into a compound string — the compound-id
/// wire form only exists at the CDS-client boundary (see `cds_client`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Folder { relay_id: String, folder_id: String },
    Document {
        relay_id: String,
        folder_id: String,
        document_id: String,
    },
    Canvas {
        relay_id: String,
        folder_id: String,
        canvas_id: String,
    },
    File {
        relay_id: String,
        folder_id: String,
        file_id: String,
    },
}

impl Resource {
    pub fn relay_id(&self) -> &str {
        match self {
            Resource::Folder { relay_id, .. }
            | Resource::Document { relay_id, .. }
            | Resource::Canvas { relay_id, .. }
            | Resource::File { relay_id, .. } => relay_id,
        }
    }

    pub fn folder_id(&self) -> &str {
        match self {
            Resource::Folder { folder_id, .. }
            | Resource::Document { folder_id, .. }
            | Resource::Canvas { folder_id, .. }
            | Resource::File { folder_id, .. } => folder_id,
        }
    }

    /// The bare id of this resource (not the folder it lives in): the
    /// folder id for a `Folder`, the document/canvas/file id otherwise.
    pub fn resource_id(&self) -> &str {
        match self {
            Resource::Folder { folder_id, .. } => folder_id,
            Resource::Document { document_id, .. } => document_id,
            Resource::Canvas { canvas_id, .. } => canvas_id,
            Resource::File { file_id, .. } => file_id,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Folder { .. } => ResourceKind::Folder,
            Resource::Document { .. } => ResourceKind::Document,
            Resource::Canvas { .. } => ResourceKind::Canvas,
            Resource::File { .. } => ResourceKind::File,
        }
    }
}
