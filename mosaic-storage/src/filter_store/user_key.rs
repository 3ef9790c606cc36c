//! User-scoped persistence keys.
//!
//! The private inner struct means a [`UserScopedKey`] can only be created by
//! naming a user, so one account can never read another's filters.
//!
//! # Format
//!
//! `filters/{user}/{partition}`. The user segment is escaped so it never
//! contains `/` or `.`, which keeps the key usable as a relative file path.

use mosaic_core::{Partition, UserId};
use std::fmt::Write as _;

const PREFIX: &str = "filters";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserScopedKey {
    inner: UserKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UserKeyInner {
    user_id: UserId,
    partition: Partition,
}

impl UserScopedKey {
    pub fn new(user_id: UserId, partition: Partition) -> Self {
        Self {
            inner: UserKeyInner { user_id, partition },
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn partition(&self) -> Partition {
        self.inner.partition
    }

    pub fn encode(&self) -> String {
        format!(
            "{PREFIX}/{}/{}",
            escape(self.inner.user_id.as_str()),
            self.inner.partition
        )
    }

    /// Returns `None` for anything `encode` would not produce.
    pub fn decode(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split('/');
        if parts.next()? != PREFIX {
            return None;
        }
        let user = unescape(parts.next()?)?;
        let partition = match parts.next()? {
            "active" => Partition::Active,
            "trashed" => Partition::Trashed,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(UserId::new(user), partition))
    }

    /// Prefix shared by every key of one user.
    pub fn user_prefix(user_id: &UserId) -> String {
        format!("{PREFIX}/{}/", escape(user_id.as_str()))
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn unescape(escaped: &str) -> Option<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = escaped.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' => {
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
