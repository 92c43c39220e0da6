// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Ctrl-C only raises the flag. Long copies stop at the next chunk boundary
/// so that temporary files are cleaned up. Chunks already flashed to a
/// partition stay there.
fn install_cancel_handler() -> Arc<AtomicBool> {
    let cancel_signal = Arc::new(AtomicBool::new(false));
    let handler_signal = Arc::clone(&cancel_signal);

    ctrlc::set_handler(move || handler_signal.store(true, Ordering::SeqCst))
        .expect("Failed to set signal handler");

    cancel_signal
}

fn main() -> ExitCode {
    let cancel_signal = install_cancel_handler();

    let Err(e) = hperoot::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal) else {
        return ExitCode::SUCCESS;
    };

    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        error!("{e:?}");
    } else {
        eprintln!("{e:?}");
    }

    ExitCode::FAILURE
}
