use std::fmt;

use mongodb::bson::{doc, Document};

use super::StoreError;

/// Update-operator tag used by [`DocumentStore::bulk_update`].
///
/// Each member maps to a fixed MongoDB update operator; `wrap` builds the
/// `{ "<operator>": { ...fields } }` document a bulk request carries.
///
/// [`DocumentStore::bulk_update`]: super::DocumentStore::bulk_update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Set,
    Push,
    PushIfMissing,
    Pull,
    Inc,
    Unset,
    Rename,
}

impl Opcode {
    pub const ALL: [Opcode; 7] = [
        Opcode::Set,
        Opcode::Push,
        Opcode::PushIfMissing,
        Opcode::Pull,
        Opcode::Inc,
        Opcode::Unset,
        Opcode::Rename,
    ];

    /// The MongoDB operator string this tag renders to.
    pub fn operator(self) -> &'static str {
        match self {
            Opcode::Set => "$set",
            Opcode::Push => "$push",
            Opcode::PushIfMissing => "$addToSet",
            Opcode::Pull => "$pull",
            Opcode::Inc => "$inc",
            Opcode::Unset => "$unset",
            Opcode::Rename => "$rename",
        }
    }

    /// Short name accepted by [`Opcode::parse`] alongside the operator string.
    pub fn tag(self) -> &'static str {
        match self {
            Opcode::Set => "set",
            Opcode::Push => "push",
            Opcode::PushIfMissing => "push_if_missing",
            Opcode::Pull => "pull",
            Opcode::Inc => "inc",
            Opcode::Unset => "unset",
            Opcode::Rename => "rename",
        }
    }

    /// Strict lookup: maps a tag or operator string back to its member.
    ///
    /// Unknown input is an error; use [`Opcode::resolve`] when a raw operator
    /// string should pass through untouched instead.
    pub fn parse(raw: &str) -> Result<Opcode, StoreError> {
        Self::ALL
            .into_iter()
            .find(|op| raw == op.tag() || raw == op.operator())
            .ok_or_else(|| StoreError::UnknownOpcode(raw.to_string()))
    }

    /// Lenient lookup: canonicalizes known tags to their operator string and
    /// returns unknown input unchanged.
    pub fn resolve(raw: &str) -> &str {
        match Self::parse(raw) {
            Ok(op) => op.operator(),
            Err(_) => raw,
        }
    }

    /// Builds the update document applying this operator to `fields`.
    pub fn wrap(self, fields: Document) -> Document {
        doc! { self.operator(): fields }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operator())
    }
}
