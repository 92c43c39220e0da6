// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Root the Google Play Games for PC emulator with Magisk.
//!
//! Only the command line interface is stable. The modules are public so the
//! integration tests can drive them directly.

pub mod cli;
pub mod disk;
pub mod format;
pub mod install;
pub mod patch;
pub mod stream;
pub mod util;
