// ABOUTME: Deterministic pglogical object names per migration pair and SQL identifier quoting
// ABOUTME: Names stay within PostgreSQL's 63-byte identifier limit

use sha2::{Digest, Sha256};

const MAX_SLUG: usize = 40;
const SUFFIX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    pub provider_node: String,
    pub subscriber_node: String,
    pub set: String,
    pub subscription: String,
}

impl ObjectNames {
    pub fn for_pair(pair_id: &str) -> Self {
        let slug = slug(pair_id);
        Self {
            provider_node: format!("{}_provider", slug),
            subscriber_node: format!("{}_subscriber", slug),
            set: format!("{}_set", slug),
            subscription: format!("{}_sub", slug),
        }
    }
}

/// Readable prefix plus a hash of the raw id. Cleaning folds case and punctuation,
/// so the suffix is what keeps distinct pair ids apart.
fn slug(pair_id: &str) -> String {
    let mut cleaned: String = pair_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    cleaned.truncate(MAX_SLUG - SUFFIX_LEN - 1);
    let digest = Sha256::digest(pair_id.as_bytes());
    let suffix: String = digest
        .iter()
        .take(SUFFIX_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}_{}", cleaned, suffix)
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote `schema.relation`; a name without a schema is quoted as-is.
pub fn quote_qualified(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, rel)) => format!("{}.{}", quote_ident(schema), quote_ident(rel)),
        None => quote_ident(name),
    }
}
