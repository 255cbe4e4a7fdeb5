//! Contains all the filetypes that `libmtp` claims to support and the mapping
//! from file extensions used when submitting new objects to a device.

use num_derive::{FromPrimitive, ToPrimitive};
use std::path::Path;

/// Enumeration that holds the supported filetypes. The discriminants mirror the
/// raw `LIBMTP_filetype_t` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum Filetype {
    Folder = 0,
    Wav,
    Mp3,
    Wma,
    Ogg,
    Audible,
    Mp4,
    UndefAudio,
    Wmv,
    Avi,
    Mpeg,
    Asf,
    Qt,
    UndefVideo,
    Jpeg,
    Jfif,
    Tiff,
    Bmp,
    Gif,
    Pict,
    Png,
    VCalendar1,
    VCalendar2,
    VCard2,
    VCard3,
    WindowsImageFormat,
    WinExec,
    Text,
    Html,
    Firmware,
    Aac,
    MediaCard,
    Flac,
    Mp2,
    M4a,
    Doc,
    Xml,
    Xls,
    Ppt,
    Mht,
    Jp2,
    Jpx,
    Album,
    Playlist,
    Unknown,
}

impl Filetype {
    /// Guess the MTP filetype for a path from its extension. Devices accept
    /// `Unknown` for anything not in the table.
    pub fn from_path(path: impl AsRef<Path>) -> Filetype {
        let ext = match path.as_ref().extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => return Filetype::Unknown,
        };

        match ext.as_str() {
            "wav" => Filetype::Wav,
            "mp3" => Filetype::Mp3,
            "wma" => Filetype::Wma,
            "ogg" => Filetype::Ogg,
            "ape" => Filetype::Audible,
            "mp4" => Filetype::Mp4,
            "wmv" => Filetype::Wmv,
            "avi" => Filetype::Avi,
            "mpeg" => Filetype::Mpeg,
            "asf" => Filetype::Asf,
            "qt" => Filetype::Qt,
            "jpeg" => Filetype::Jpeg,
            "jfif" => Filetype::Jfif,
            "tiff" => Filetype::Tiff,
            "bmp" => Filetype::Bmp,
            "gif" => Filetype::Gif,
            "pict" => Filetype::Pict,
            "png" => Filetype::Png,
            "text" | "txt" => Filetype::Text,
            "html" => Filetype::Html,
            "aac" => Filetype::Aac,
            "flac" => Filetype::Flac,
            "mp2" => Filetype::Mp2,
            "m4a" => Filetype::M4a,
            "doc" => Filetype::Doc,
            "xml" => Filetype::Xml,
            "xls" => Filetype::Xls,
            "ppt" => Filetype::Ppt,
            "mht" => Filetype::Mht,
            "jp2" => Filetype::Jp2,
            "jpx" => Filetype::Jpx,
            _ => Filetype::Unknown,
        }
    }

    pub fn is_folder(self) -> bool {
        self == Filetype::Folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn extension_lookup_is_case_insensitive() {
        assert_eq!(Filetype::from_path("/Internal/Music/track.MP3"), Filetype::Mp3);
        assert_eq!(Filetype::from_path("photo.Jpeg"), Filetype::Jpeg);
    }

    #[test]
    fn text_has_two_spellings() {
        assert_eq!(Filetype::from_path("readme.txt"), Filetype::Text);
        assert_eq!(Filetype::from_path("readme.text"), Filetype::Text);
    }

    #[test]
    fn unknown_extensions_fall_back_to_unknown() {
        assert_eq!(Filetype::from_path("archive.tar.zst"), Filetype::Unknown);
        assert_eq!(Filetype::from_path("no_extension"), Filetype::Unknown);
        assert_eq!(Filetype::from_path(".hidden"), Filetype::Unknown);
    }

    #[test]
    fn discriminants_round_trip_through_raw_values() {
        let raw = Filetype::Png.to_u32().unwrap();
        assert_eq!(Filetype::from_u32(raw), Some(Filetype::Png));
        assert_eq!(Filetype::from_u32(0), Some(Filetype::Folder));
        assert!(Filetype::Folder.is_folder());
        assert!(!Filetype::Png.is_folder());
    }
}
