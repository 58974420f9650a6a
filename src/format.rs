use std::fmt::{Display, Error, Formatter};

use crate::constants::DOWNLOAD_PROGRESS_SPAN;

pub struct SizeFormatter(pub u64);
impl Display for SizeFormatter {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        macro_rules! clamp_size {
            ($size: expr, $unit_var: expr, $unit: literal) => {
                if $size > 1024.0 {
                    $size /= 1024.0;
                    $unit_var = $unit;
                }
            };
        }

        let mut size = self.0 as f64;
        let mut unit = "B";
        clamp_size!(size, unit, "KiB");
        clamp_size!(size, unit, "MiB");
        clamp_size!(size, unit, "GiB");
        clamp_size!(size, unit, "TiB");
        write!(f, "{:.2} {}", size, unit)
    }
}

/// Map `done/total` of one phase onto the overall 0-100 progress bar.
///
/// The download phase covers `0..=DOWNLOAD_PROGRESS_SPAN`, the upload phase
/// the rest. An unknown total (0) reports the start of the phase.
pub fn overall_progress(uploading: bool, done: u64, total: u64) -> u8 {
    let (start, span) = if uploading {
        (DOWNLOAD_PROGRESS_SPAN, 100 - DOWNLOAD_PROGRESS_SPAN)
    } else {
        (0, DOWNLOAD_PROGRESS_SPAN)
    };
    if total == 0 {
        return start;
    }
    let ratio = done.min(total) as f64 / total as f64;
    start + (ratio * span as f64).floor() as u8
}

/// Text sent to telegram chats and stored in transfer records.
pub mod msg {
    use super::*;

    pub struct MsgStart;
    impl Display for MsgStart {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(
                f,
                "Hi! I relay videos from telegram to google drive.\nSend me a video to upload it.\nUse /help to list available commands."
            )
        }
    }

    pub struct MsgSendVideo;
    impl Display for MsgSendVideo {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(f, "Please send a video.")
        }
    }

    pub struct MsgReceiving;
    impl Display for MsgReceiving {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(f, "Receiving video... Please wait.")
        }
    }

    pub struct MsgVideoStored {
        pub message_id: i32,
    }
    impl Display for MsgVideoStored {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(
                f,
                "Video received (message {}). Start the transfer from the web dashboard.",
                self.message_id
            )
        }
    }

    pub struct MsgUploadDone<'a> {
        pub file_id: &'a str,
    }
    impl Display for MsgUploadDone<'_> {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(
                f,
                "Video transferred successfully!\nDrive ID: {}",
                self.file_id
            )
        }
    }

    pub struct MsgUploadFailed;
    impl Display for MsgUploadFailed {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            write!(f, "Sorry, an error occurred while transferring the video.")
        }
    }

    pub enum MsgProgress {
        Starting,
        Downloading { done: u64, total: u64 },
        Uploading { done: u64, total: u64 },
    }
    impl Display for MsgProgress {
        fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
            match self {
                MsgProgress::Starting => write!(f, "Starting download..."),
                MsgProgress::Downloading { done, total } => write!(
                    f,
                    "Downloading from telegram {}/{}",
                    SizeFormatter(*done),
                    SizeFormatter(*total)
                ),
                MsgProgress::Uploading { done, total } => write!(
                    f,
                    "Uploading to drive {}/{}",
                    SizeFormatter(*done),
                    SizeFormatter(*total)
                ),
            }
        }
    }
}
