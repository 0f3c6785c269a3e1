use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Decoded image payload plus its declared mime type.
///
/// The UI collaborator hands images over as base64 data URLs; the mime type
/// is taken from the URL's type declaration, never guessed from a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            mime: mime.into(),
        }
    }

    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .context("not a data URL (missing 'data:' scheme)")?;
        let (header, payload) = rest
            .split_once(',')
            .context("malformed data URL (missing ',')")?;
        let header = header
            .strip_suffix(";base64")
            .context("only base64 data URLs are supported")?;
        let mime = if header.is_empty() {
            "image/png".to_string()
        } else {
            header.to_string()
        };
        let bytes = BASE64
            .decode(payload.as_bytes())
            .context("data URL base64 decode failed")?;
        Ok(Self { bytes, mime })
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

/// Where the edit-history machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineageState {
    Empty,
    Editing,
    ResultPending,
}

/// Ordered sequence of committed image snapshots plus a cursor, with linear
/// undo semantics: committing after an undo truncates the redone-away tail,
/// it does not fork. A generated result is held outside the lineage until
/// explicitly committed or discarded.
#[derive(Debug, Clone, Default)]
pub struct ImageLineage {
    history: Vec<ImageData>,
    index: usize,
    pending: Option<ImageData>,
}

impl ImageLineage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LineageState {
        if self.history.is_empty() {
            LineageState::Empty
        } else if self.pending.is_some() {
            LineageState::ResultPending
        } else {
            LineageState::Editing
        }
    }

    /// Currently displayed base image: `history[index]`.
    pub fn current(&self) -> Option<&ImageData> {
        self.history.get(self.index)
    }

    pub fn pending(&self) -> Option<&ImageData> {
        self.pending.as_ref()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.index
    }

    pub fn can_undo(&self) -> bool {
        !self.history.is_empty() && self.index > 0
    }

    pub fn can_redo(&self) -> bool {
        !self.history.is_empty() && self.index + 1 < self.history.len()
    }

    /// Resets the lineage to a single-entry sequence at cursor 0 and drops
    /// any pending result.
    pub fn load(&mut self, image: ImageData) {
        self.history = vec![image];
        self.index = 0;
        self.pending = None;
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.index = 0;
        self.pending = None;
    }

    /// Holds a freshly generated image as the pending result without
    /// mutating history. Replaces any previous pending result.
    pub fn stage_result(&mut self, image: ImageData) -> Result<()> {
        if self.history.is_empty() {
            bail!("cannot stage a result with no base image loaded");
        }
        self.pending = Some(image);
        Ok(())
    }

    pub fn discard_pending(&mut self) {
        self.pending = None;
    }

    /// Promotes the pending result to the new lineage head, truncating any
    /// redo tail past the cursor first.
    pub fn commit(&mut self) -> Result<&ImageData> {
        let Some(image) = self.pending.take() else {
            bail!("no pending result to commit");
        };
        self.history.truncate(self.index + 1);
        self.history.push(image);
        self.index = self.history.len() - 1;
        Ok(&self.history[self.index])
    }

    pub fn undo(&mut self) -> bool {
        if !self.can_undo() {
            return false;
        }
        self.index -= 1;
        self.pending = None;
        true
    }

    pub fn redo(&mut self) -> bool {
        if !self.can_redo() {
            return false;
        }
        self.index += 1;
        self.pending = None;
        true
    }
}
