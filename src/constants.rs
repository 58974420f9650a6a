//! Centralized constants for the teledrive bot.
//!
//! This module contains the constants that control transfers, the
//! google drive client and the in-memory caches.

use std::time::Duration;

// ============================================================================
// Google Drive Settings
// ============================================================================

/// OAuth scope limited to files created by this application.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Base url of the drive upload endpoint.
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com";

/// Resumable upload chunks must be a multiple of 256 KiB.
pub const UPLOAD_CHUNK_ALIGN: usize = 256 * 1024;

/// Default resumable upload chunk size (8 MiB)
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 32 * UPLOAD_CHUNK_ALIGN;

/// A token expiring within this window is refreshed before use.
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

// ============================================================================
// Transfer Settings
// ============================================================================

/// Mime type sent to drive for every relayed video.
pub const VIDEO_MIME: &str = "video/mp4";

/// File name used when telegram does not provide one.
pub const DEFAULT_VIDEO_NAME: &str = "video.mp4";

/// Share of the overall progress bar taken by the download phase.
pub const DOWNLOAD_PROGRESS_SPAN: u8 = 50;

/// Number of transfer records kept for status queries
pub const TRANSFER_HISTORY_SIZE: usize = 256;

/// Size of the LRU cache for received video messages
pub const VIDEO_INBOX_SIZE: usize = 4096;
