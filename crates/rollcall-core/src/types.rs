use serde::{Deserialize, Serialize};

/// Axis-aligned face region in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Length of the shorter side, used by the minimum-size quality check.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }
}

/// Five-point facial keypoints as produced by SCRFD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoints {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
    pub mouth_left: (f32, f32),
    pub mouth_right: (f32, f32),
}

/// One face found by a [`FaceDetector`](crate::FaceDetector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Absent when the detector could not decode landmarks for this box.
    pub keypoints: Option<Keypoints>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector has
    /// similarity 0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// L2-normalize in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }

    /// Little-endian f32 encoding used for BLOB storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` when the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

/// Review state of an enrolled identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Pending,
    Approved,
    Rejected,
}

impl IdentityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityStatus::Pending => "pending",
            IdentityStatus::Approved => "approved",
            IdentityStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(IdentityStatus::Pending),
            "approved" => Some(IdentityStatus::Approved),
            "rejected" => Some(IdentityStatus::Rejected),
            _ => None,
        }
    }
}

/// An enrolled principal (a student) and its reference embeddings.
///
/// Embeddings are kept in enrollment order. An approved identity always has
/// at least one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: String,
    pub name: String,
    /// Course the identity attends; selects the timetable used at check-in.
    pub course_id: i64,
    pub status: IdentityStatus,
    pub embeddings: Vec<Embedding>,
}

/// One gallery row: an identity and all of its reference embeddings.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity_id: String,
    pub embeddings: Vec<Embedding>,
}

/// Enrolled identities queried during recognition.
///
/// Iteration order is insertion order, which is also the tie-break order
/// used by [`FaceMatcher`](crate::FaceMatcher).
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an identity. Entries with no embeddings are ignored, since
    /// they can never match.
    pub fn insert(&mut self, identity_id: impl Into<String>, embeddings: Vec<Embedding>) {
        if embeddings.is_empty() {
            return;
        }
        self.entries.push(GalleryEntry {
            identity_id: identity_id.into(),
            embeddings,
        });
    }

    pub fn get(&self, identity_id: &str) -> Option<&GalleryEntry> {
        self.entries.iter().find(|e| e.identity_id == identity_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GalleryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of stored embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.entries.iter().map(|e| e.embeddings.len()).sum()
    }
}

impl FromIterator<(String, Vec<Embedding>)> for Gallery {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Embedding>)>>(iter: I) -> Self {
        let mut gallery = Gallery::new();
        for (id, embeddings) in iter {
            gallery.insert(id, embeddings);
        }
        gallery
    }
}
