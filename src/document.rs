//! Client-side document and attachment model.
//!
//! A `Document<T>` is ephemeral: the authoritative copy lives on the
//! server, and `rev` advances only when the server acknowledges a write.
//! Attachments carry their own state so the write path can diff them
//! against the server without side collections.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};

/// A typed document with its CouchDB envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document<T> {
    /// Empty until assigned locally or by the first server round-trip.
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Server-assigned revision; must be echoed on update and delete.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(
        rename = "_attachments",
        default,
        skip_serializing_if = "AttachmentSet::is_wire_empty"
    )]
    pub attachments: AttachmentSet,

    #[serde(flatten)]
    pub payload: T,
}

impl<T> Document<T> {
    /// A new unsaved document; the id is assigned at save time.
    pub fn new(payload: T) -> Self {
        Self {
            id: String::new(),
            rev: None,
            attachments: AttachmentSet::default(),
            payload,
        }
    }

    pub fn with_id(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            rev: None,
            attachments: AttachmentSet::default(),
            payload,
        }
    }

    /// Stage a file attachment for upload on the next save.
    pub fn attach_file(
        &mut self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        path: impl Into<PathBuf>,
    ) {
        self.attachments
            .stage(name.into(), content_type.into(), AttachmentContent::File(path.into()));
    }

    /// Stage an inline-bytes attachment for upload on the next save.
    pub fn attach_bytes(
        &mut self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) {
        self.attachments
            .stage(name.into(), content_type.into(), AttachmentContent::Bytes(bytes));
    }

    /// Mark an attachment for deletion on the next save.
    pub fn remove_attachment(&mut self, name: &str) {
        self.attachments.mark_deleted(name);
    }
}

impl<T: DeserializeOwned> Document<T> {
    pub(crate) fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Lifecycle state of one attachment entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// In sync with the server: digest and length are known.
    Clean,
    /// Staged locally, never uploaded.
    Added,
    /// Exists on the server, new content staged locally.
    Modified,
    /// Marked for deletion; removed from the set once the server confirms.
    Deleted,
}

/// Where the bytes of a staged attachment come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentContent {
    /// Nothing staged locally (Clean or Deleted entries).
    None,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// A named binary blob versioned with the document's rev.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    /// Server content hash; present whenever the entry is `Clean`.
    pub digest: Option<String>,
    pub length: Option<u64>,
    pub content: AttachmentContent,
    /// Download URL, filled in when the owning document is hydrated.
    pub uri: Option<String>,
    pub document_id: Option<String>,
    pub document_rev: Option<String>,
    pub state: AttachmentState,
}

/// Attachments of one document, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentSet {
    entries: BTreeMap<String, Attachment>,
}

impl AttachmentSet {
    pub fn get(&self, name: &str) -> Option<&Attachment> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attachment> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no entry would serialize into the document body.
    pub fn is_wire_empty(&self) -> bool {
        !self
            .entries
            .values()
            .any(|a| a.state != AttachmentState::Added)
    }

    /// Entries to upload, in name order: `Added` and `Modified`.
    pub(crate) fn pending_uploads(&self) -> impl Iterator<Item = &Attachment> {
        self.entries
            .values()
            .filter(|a| matches!(a.state, AttachmentState::Added | AttachmentState::Modified))
    }

    /// Entries to delete server-side.
    pub(crate) fn pending_deletes(&self) -> impl Iterator<Item = &Attachment> {
        self.entries
            .values()
            .filter(|a| a.state == AttachmentState::Deleted)
    }

    pub(crate) fn stage(&mut self, name: String, content_type: String, content: AttachmentContent) {
        match self.entries.get_mut(&name) {
            Some(existing) => {
                // Re-staging over a server copy is a modification; over a
                // never-uploaded entry it just replaces the staged bytes.
                existing.content_type = content_type;
                existing.content = content;
                if existing.state != AttachmentState::Added {
                    existing.state = AttachmentState::Modified;
                }
            }
            None => {
                self.entries.insert(
                    name.clone(),
                    Attachment {
                        name,
                        content_type,
                        digest: None,
                        length: None,
                        content,
                        uri: None,
                        document_id: None,
                        document_rev: None,
                        state: AttachmentState::Added,
                    },
                );
            }
        }
    }

    pub(crate) fn mark_deleted(&mut self, name: &str) {
        let Some(entry) = self.entries.get_mut(name) else {
            return;
        };
        if entry.state == AttachmentState::Added {
            // Never reached the server; nothing to delete there.
            self.entries.remove(name);
        } else {
            entry.state = AttachmentState::Deleted;
            entry.content = AttachmentContent::None;
        }
    }

    /// Record a confirmed upload: the entry is now the server copy.
    pub(crate) fn confirm_upload(&mut self, name: &str, rev: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.state = AttachmentState::Clean;
            entry.content = AttachmentContent::None;
            entry.document_rev = Some(rev.to_string());
        }
    }

    /// Record a confirmed deletion: the entry leaves the set.
    pub(crate) fn confirm_delete(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Fill in download URIs and ownership after a read, forcing every
    /// entry `Clean`.
    pub(crate) fn hydrate(&mut self, document_id: &str, document_rev: Option<&str>, base_uri: &str) {
        for (name, entry) in self.entries.iter_mut() {
            entry.state = AttachmentState::Clean;
            entry.document_id = Some(document_id.to_string());
            entry.document_rev = document_rev.map(|r| r.to_string());
            entry.uri = Some(format!(
                "{}/{}",
                base_uri,
                crate::client::escape_segment(name)
            ));
        }
    }
}

/// Wire form of one `_attachments` entry.
#[derive(Debug, Serialize, Deserialize)]
struct WireAttachment {
    content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    length: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stub: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revpos: Option<u64>,
}

impl Serialize for AttachmentSet {
    /// Stub entries for everything the server already holds. An attachment
    /// omitted from `_attachments` is dropped by the document update, so
    /// `Deleted` entries keep their stub until the DELETE round-trip
    /// confirms. `Added` entries are withheld; they upload through their
    /// own PUT.
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let stubs: Vec<(&String, &Attachment)> = self
            .entries
            .iter()
            .filter(|(_, a)| a.state != AttachmentState::Added)
            .collect();
        let mut map = serializer.serialize_map(Some(stubs.len()))?;
        for (name, att) in stubs {
            map.serialize_entry(
                name,
                &WireAttachment {
                    content_type: att.content_type.clone(),
                    digest: att.digest.clone(),
                    length: att.length,
                    stub: true,
                    revpos: None,
                },
            )?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttachmentSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = BTreeMap::<String, WireAttachment>::deserialize(deserializer)?;
        let entries = wire
            .into_iter()
            .map(|(name, w)| {
                (
                    name.clone(),
                    Attachment {
                        name,
                        content_type: w.content_type,
                        digest: w.digest,
                        length: w.length,
                        content: AttachmentContent::None,
                        uri: None,
                        document_id: None,
                        document_rev: None,
                        state: AttachmentState::Clean,
                    },
                )
            })
            .collect();
        Ok(Self { entries })
    }
}
