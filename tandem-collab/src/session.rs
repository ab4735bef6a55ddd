//! Session codes: short document ids and the join codes users share.
//!
//! A document id is five decimal digits. A join code appends one letter
//! selecting the UI mode of whoever joins with it:
//! ```text
//! 48213E   → edit document 48213
//! 48213V   → view document 48213 (client-side gate only)
//! ```

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use tandem_core::AccessMode;

/// Digits in a document id.
pub const DOCUMENT_ID_LEN: usize = 5;

/// Smallest and largest five-digit document ids.
const DOCUMENT_ID_RANGE: std::ops::RangeInclusive<u32> = 10_000..=99_999;

/// Fresh random document id in `10000..=99999`.
pub fn generate_document_id() -> String {
    rand::thread_rng().gen_range(DOCUMENT_ID_RANGE).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinCodeError {
    #[error("Join code must be {expected} characters, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("Document id must be digits only")]
    NonDigit,
    #[error("Join code must end in 'E' (editor) or 'V' (viewer), got '{0}'")]
    Mode(char),
}

/// A parsed, validated join code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCode {
    pub doc_id: String,
    pub mode: AccessMode,
}

impl JoinCode {
    /// Validate `code` locally. Nothing is sent before this succeeds.
    pub fn parse(code: &str) -> Result<Self, JoinCodeError> {
        let code = code.trim();
        let actual = code.chars().count();
        if actual != DOCUMENT_ID_LEN + 1 {
            return Err(JoinCodeError::Length {
                expected: DOCUMENT_ID_LEN + 1,
                actual,
            });
        }

        let Some((split, suffix)) = code.char_indices().last() else {
            return Err(JoinCodeError::Length {
                expected: DOCUMENT_ID_LEN + 1,
                actual,
            });
        };
        let doc_id = &code[..split];
        if !doc_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(JoinCodeError::NonDigit);
        }

        let mode = match suffix {
            'E' => AccessMode::Editor,
            'V' => AccessMode::Viewer,
            other => return Err(JoinCodeError::Mode(other)),
        };

        Ok(Self {
            doc_id: doc_id.to_string(),
            mode,
        })
    }

    pub fn editor(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            mode: AccessMode::Editor,
        }
    }

    pub fn viewer(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            mode: AccessMode::Viewer,
        }
    }
}

impl fmt::Display for JoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.mode {
            AccessMode::Editor => 'E',
            AccessMode::Viewer => 'V',
        };
        write!(f, "{}{suffix}", self.doc_id)
    }
}

impl FromStr for JoinCode {
    type Err = JoinCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
