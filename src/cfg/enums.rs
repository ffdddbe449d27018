// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Runtime environment tag.
///
/// `dev` enables dev-only behaviour (the stress-test echo hijack), `release`
/// disables the more expensive diagnostic sampling. There is no other
/// environment-dependent logic in the gateway core.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Env {
    #[default]
    Dev,
    Debug,
    Release,
}

impl Env {
    pub fn is_dev(&self) -> bool {
        matches!(self, Env::Dev)
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Env::Release)
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Env::Dev => write!(f, "dev"),
            Env::Debug => write!(f, "debug"),
            Env::Release => write!(f, "release"),
        }
    }
}
