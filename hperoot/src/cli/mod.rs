// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod args;
pub mod bios;
pub mod boot;
pub mod disk;
pub mod root;

/// Progress message for the user, printed in bold to stdout.
macro_rules! status {
    ($($arg:tt)+) => {
        println!("\x1b[1m[*] {}\x1b[0m", format_args!($($arg)+))
    };
}

/// Like [`status!`], but in red for things the user should look at.
macro_rules! warning {
    ($($arg:tt)+) => {
        println!("\x1b[1;31m[!] {}\x1b[0m", format_args!($($arg)+))
    };
}

pub(crate) use status;
pub(crate) use warning;
