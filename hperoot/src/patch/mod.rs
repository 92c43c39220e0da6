// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod apk;
pub mod classify;
pub mod magiskboot;
pub mod pipeline;
pub mod signature;
