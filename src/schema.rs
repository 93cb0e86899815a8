//! Table shape captured from the live catalog and replayed onto shadow tables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Which life-cycle slot a physical table (or index) occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// Visible to readers under the logical name.
    Production,
    /// Being populated; never queried externally.
    Shadow,
    /// The previous production table, waiting to be dropped.
    Retiring,
}

impl Generation {
    fn suffix(self) -> &'static str {
        match self {
            Generation::Production => "",
            Generation::Shadow => "__shadow",
            Generation::Retiring => "__retiring",
        }
    }
}

/// Hex digits of the name digest kept when a name has to be shortened.
const DIGEST_HEX_LEN: usize = 8;

/// Physical name of `base` in the given generation.
///
/// When the suffixed name would exceed [`MAX_IDENTIFIER_LEN`], the base is
/// cut on a char boundary and tagged with a digest of the full base, so
/// two long names sharing a prefix still map to distinct identifiers.
pub fn generation_name(base: &str, generation: Generation) -> String {
    let suffix = generation.suffix();
    if base.len() + suffix.len() <= MAX_IDENTIFIER_LEN {
        return format!("{}{}", base, suffix);
    }
    let budget = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len() + DIGEST_HEX_LEN + 1);
    let mut end = base.len().min(budget);
    while !base.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}{}", &base[..end], name_digest(base), suffix)
}

fn name_digest(base: &str) -> String {
    Sha256::digest(base.as_bytes())
        .iter()
        .take(DIGEST_HEX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Ordinary,
    FullText,
}

/// A secondary index, detailed enough to recreate it verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub unique: bool,
    pub kind: IndexKind,
    /// Key columns in index order. The order is significant.
    pub columns: Vec<String>,
}

impl IndexDefinition {
    pub fn ordinary(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            unique: false,
            kind: IndexKind::Ordinary,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn unique(name: &str, columns: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::ordinary(name, columns)
        }
    }

    pub fn full_text(name: &str, columns: &[&str]) -> Self {
        Self {
            kind: IndexKind::FullText,
            ..Self::ordinary(name, columns)
        }
    }

    /// The same definition under its name in another generation.
    pub fn renamed_for(&self, generation: Generation) -> Self {
        Self {
            name: generation_name(&self.name, generation),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Constraint name; the backing index shares it.
    pub name: String,
    pub columns: Vec<String>,
}
