use crate::error::ConversionError;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, info};

/// Calibre's command line converter.
pub const EBOOK_CONVERT: &str = "ebook-convert";

/// Additional formats the EPUB can be converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Mobi,
    Azw3,
    Pdf,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Mobi => "mobi",
            Format::Azw3 => "azw3",
            Format::Pdf => "pdf",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobi" => Ok(Format::Mobi),
            "azw3" => Ok(Format::Azw3),
            "pdf" => Ok(Format::Pdf),
            other => Err(format!("unsupported format '{other}', expected mobi, azw3 or pdf")),
        }
    }
}

/// Arguments passed to the converter, input first.
pub fn conversion_args(input: &Path, output: &Path, kindle: bool) -> Vec<OsString> {
    let mut args = vec![input.as_os_str().to_owned(), output.as_os_str().to_owned()];
    if kindle {
        args.push("--output-profile".into());
        args.push("kindle".into());
    }
    args
}

pub struct Converter {
    program: String,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(EBOOK_CONVERT)
    }
}

impl Converter {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Converts `input` next to itself, keeping the original file.
    pub fn convert(&self, input: &Path, format: Format, kindle: bool) -> Result<PathBuf, ConversionError> {
        let program = which::which(&self.program).map_err(|_| ConversionError::Missing(self.program.clone()))?;
        let output = input.with_extension(format.extension());

        info!("Converting {input:?} to {format}");
        let args = conversion_args(input, &output, kindle);
        debug!("Running {program:?} with {args:?}");
        let result = Command::new(&program).args(&args).output()?;

        if !result.status.success() {
            return Err(ConversionError::Failed {
                program: self.program.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        info!("Wrote {output:?}");
        Ok(output)
    }
}

#[test]
fn test_conversion_args() {
    let args = conversion_args(Path::new("book.epub"), Path::new("book.azw3"), false);
    assert_eq!(vec![OsString::from("book.epub"), OsString::from("book.azw3")], args);

    let args = conversion_args(Path::new("book.epub"), Path::new("book.mobi"), true);
    assert_eq!(&args[2..], &[OsString::from("--output-profile"), OsString::from("kindle")]);
}

#[test]
fn test_format_parse() {
    assert_eq!(Ok(Format::Azw3), "AZW3".parse());
    assert!("docx".parse::<Format>().is_err());
}

#[test]
fn test_missing_converter() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    std::fs::write(&input, b"not really an epub").unwrap();

    let converter = Converter::new("lw-epub-no-such-converter");
    match converter.convert(&input, Format::Mobi, false) {
        Err(ConversionError::Missing(program)) => assert_eq!("lw-epub-no-such-converter", program),
        other => panic!("expected a missing converter error, got {other:?}"),
    }
    assert!(input.exists());
}
