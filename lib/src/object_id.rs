// Copyright 2024 The Gantry Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary identifiers rendered as hex. Two kinds exist: commit hashes
//! (forge heads are 40-hex SHA-1s; store commits use whatever hash the
//! store computes) and build fingerprints.

use std::fmt::{Debug, Error, Formatter};

/// A commit hash.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(Vec<u8>);

impl CommitId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        CommitId(bytes.to_vec())
    }

    /// Parses forge-supplied hex. `None` unless the text is non-empty,
    /// even-length hex; the empty string in particular would otherwise
    /// decode to an empty id, which nothing downstream can use.
    pub fn try_from_hex(hex: &str) -> Option<Self> {
        if hex.is_empty() {
            return None;
        }
        hex::decode(hex).ok().map(CommitId)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Debug for CommitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "CommitId({})", self.hex())
    }
}

/// A digest of a build node's inputs; names the cache branch the build's
/// result lives on.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Fingerprint(bytes.to_vec())
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "Fingerprint({})", self.hex())
    }
}
