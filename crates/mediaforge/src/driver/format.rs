use std::path::Path;

use crate::job::JobPayload;

/// Office document families the headless converter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfficeFamily {
    WordProcessing,
    Spreadsheet,
    Presentation,
    RichText,
}

/// What a source file is, as far as the drivers care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Image,
    Video,
    Pdf,
    Office(OfficeFamily),
}

impl SourceFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "tiff" | "tif" | "bmp" | "gif" | "webp" => Some(Self::Image),
            "mp4" | "m4v" | "mov" | "mkv" | "webm" | "avi" | "wmv" | "flv" | "mpg" | "mpeg"
            | "3gp" | "ts" => Some(Self::Video),
            "pdf" => Some(Self::Pdf),
            "doc" | "docx" | "odt" | "ott" | "docm" | "dotx" => {
                Some(Self::Office(OfficeFamily::WordProcessing))
            }
            "xls" | "xlsx" | "ods" | "ots" | "xlsm" | "csv" => {
                Some(Self::Office(OfficeFamily::Spreadsheet))
            }
            "ppt" | "pptx" | "odp" | "otp" | "pps" | "ppsx" => {
                Some(Self::Office(OfficeFamily::Presentation))
            }
            "rtf" => Some(Self::Office(OfficeFamily::RichText)),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/pdf" => return Some(Self::Pdf),
            "application/rtf" | "text/rtf" => {
                return Some(Self::Office(OfficeFamily::RichText))
            }
            "text/csv" => return Some(Self::Office(OfficeFamily::Spreadsheet)),
            _ => {}
        }

        if mime.starts_with("image/") {
            return Some(Self::Image);
        }
        if mime.starts_with("video/") {
            return Some(Self::Video);
        }

        if mime == "application/msword"
            || mime.contains("wordprocessingml")
            || mime.contains("opendocument.text")
        {
            return Some(Self::Office(OfficeFamily::WordProcessing));
        }
        if mime == "application/vnd.ms-excel"
            || mime.contains("spreadsheetml")
            || mime.contains("opendocument.spreadsheet")
        {
            return Some(Self::Office(OfficeFamily::Spreadsheet));
        }
        if mime == "application/vnd.ms-powerpoint"
            || mime.contains("presentationml")
            || mime.contains("opendocument.presentation")
        {
            return Some(Self::Office(OfficeFamily::Presentation));
        }

        None
    }

    /// Classifies a payload: the MIME type wins when it is recognized,
    /// otherwise the source extension decides.
    pub fn detect(payload: &JobPayload) -> Option<Self> {
        payload
            .mime_type
            .as_deref()
            .and_then(Self::from_mime)
            .or_else(|| Self::from_path(&payload.source_path))
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Human-readable description of an unclassifiable source, for error rows.
pub fn describe_source(payload: &JobPayload) -> String {
    match (&payload.mime_type, payload.source_path.extension()) {
        (Some(mime), _) => mime.clone(),
        (None, Some(ext)) => format!(".{}", ext.to_string_lossy()),
        (None, None) => "file without extension".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions() {
        assert_eq!(SourceFormat::from_extension("JPG"), Some(SourceFormat::Image));
        assert_eq!(SourceFormat::from_extension("mov"), Some(SourceFormat::Video));
        assert_eq!(SourceFormat::from_extension("pdf"), Some(SourceFormat::Pdf));
        assert_eq!(
            SourceFormat::from_extension("docx"),
            Some(SourceFormat::Office(OfficeFamily::WordProcessing))
        );
        assert_eq!(
            SourceFormat::from_extension("ods"),
            Some(SourceFormat::Office(OfficeFamily::Spreadsheet))
        );
        assert_eq!(
            SourceFormat::from_extension("pptx"),
            Some(SourceFormat::Office(OfficeFamily::Presentation))
        );
        assert_eq!(
            SourceFormat::from_extension("rtf"),
            Some(SourceFormat::Office(OfficeFamily::RichText))
        );
        assert_eq!(SourceFormat::from_extension("zip"), None);
        assert_eq!(SourceFormat::from_extension(""), None);
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(SourceFormat::from_mime("image/webp"), Some(SourceFormat::Image));
        assert_eq!(SourceFormat::from_mime("video/quicktime"), Some(SourceFormat::Video));
        assert_eq!(
            SourceFormat::from_mime("application/pdf; charset=binary"),
            Some(SourceFormat::Pdf)
        );
        assert_eq!(
            SourceFormat::from_mime(
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            ),
            Some(SourceFormat::Office(OfficeFamily::Presentation))
        );
        assert_eq!(
            SourceFormat::from_mime("application/vnd.oasis.opendocument.text"),
            Some(SourceFormat::Office(OfficeFamily::WordProcessing))
        );
        assert_eq!(SourceFormat::from_mime("application/zip"), None);
    }

    #[test]
    fn test_detect_prefers_mime_then_extension() {
        let payload = JobPayload::new("/in/upload.bin").with_mime_type("video/mp4");
        assert_eq!(SourceFormat::detect(&payload), Some(SourceFormat::Video));

        let payload = JobPayload::new("/in/report.xlsx").with_mime_type("application/octet-stream");
        assert_eq!(
            SourceFormat::detect(&payload),
            Some(SourceFormat::Office(OfficeFamily::Spreadsheet))
        );

        let payload = JobPayload::new("/in/archive.tar");
        assert_eq!(SourceFormat::detect(&payload), None);
    }

    #[test]
    fn test_describe_source() {
        assert_eq!(
            describe_source(&JobPayload::new("/in/a.zip").with_mime_type("application/zip")),
            "application/zip"
        );
        let mut payload = JobPayload::new("/in/a.qqq");
        payload.mime_type = None;
        assert_eq!(describe_source(&payload), ".qqq");
    }
}
