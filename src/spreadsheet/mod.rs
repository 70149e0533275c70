pub mod heuristics;

use std::io::{Cursor, Read};

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::models::{ArchiveBytes, SpreadsheetPayload};
use heuristics::Rows;

const SPREADSHEET_EXTENSIONS: [&str; 2] = [".xlsx", ".xls"];
/// Upper bound on one decompressed entry; result workbooks are far smaller.
pub const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

/// Payloads lifted from an archive plus the entries that could not be read.
#[derive(Debug, Default, Clone)]
pub struct ArchiveContents {
    pub payloads: Vec<SpreadsheetPayload>,
    pub skipped: Vec<Error>,
}

pub trait WorkbookExtract: Send + Sync {
    /// Fails when the archive cannot be opened or no entry yields a payload.
    fn extract(&self, archive: &ArchiveBytes) -> Result<ArchiveContents>;
}

pub struct ZipWorkbookExtractor;

impl WorkbookExtract for ZipWorkbookExtractor {
    fn extract(&self, archive: &ArchiveBytes) -> Result<ArchiveContents> {
        if archive.raw_bytes.is_empty() {
            return Err(Error::Archive("archive is empty".into()));
        }
        let mut zip = ZipArchive::new(Cursor::new(archive.raw_bytes.as_slice()))
            .map_err(|e| Error::Archive(format!("open zip {}: {}", archive.resolved_url, e)))?;

        let mut contents = ArchiveContents::default();
        let mut entries = 0;
        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| Error::Archive(format!("read entry {}: {}", i, e)))?;
            if entry.is_dir() || !is_spreadsheet_entry(entry.name()) {
                continue;
            }
            entries += 1;

            let name = entry.name().to_string();
            let buf = match read_capped(&mut entry, &name, MAX_ENTRY_BYTES) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!(source_file = %name, error = %e, "spreadsheet skipped");
                    contents.skipped.push(e);
                    continue;
                }
            };

            match parse_workbook(&name, buf) {
                Ok(payload) => {
                    debug!(
                        source_file = %name,
                        participants = payload.participant_count,
                        rows = payload.data_rows.len(),
                        "spreadsheet parsed"
                    );
                    contents.payloads.push(payload);
                }
                Err(e) => {
                    warn!(source_file = %name, error = %e, "spreadsheet skipped");
                    contents.skipped.push(e);
                }
            }
        }

        if entries == 0 {
            return Err(Error::Archive(format!(
                "no spreadsheet entries in {}",
                archive.resolved_url
            )));
        }
        if contents.payloads.is_empty() {
            return Err(contents.skipped.remove(0));
        }
        Ok(contents)
    }
}

/// Declared entry sizes come from the archive and are not trusted: the read
/// is capped instead of pre-allocated.
fn read_capped(entry: impl Read, name: &str, limit: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    entry
        .take(limit + 1)
        .read_to_end(&mut buf)
        .map_err(|e| Error::Archive(format!("read {}: {}", name, e)))?;
    if buf.len() as u64 > limit {
        return Err(Error::Archive(format!("{} is larger than {} bytes", name, limit)));
    }
    Ok(buf)
}

/// Spreadsheet by extension, ignoring macOS resource forks and Office lock files.
pub fn is_spreadsheet_entry(name: &str) -> bool {
    if name.starts_with("__MACOSX") {
        return false;
    }
    let base = name.rsplit('/').next().unwrap_or(name);
    if base.starts_with("~$") || base.starts_with("._") {
        return false;
    }
    let lower = base.to_lowercase();
    SPREADSHEET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn parse_workbook(name: &str, bytes: Vec<u8>) -> Result<SpreadsheetPayload> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| Error::Archive(format!("open workbook {}: {}", name, e)))?;

    let mut sheets = Vec::new();
    for sheet in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&sheet)
            .map_err(|e| Error::Archive(format!("read sheet {} in {}: {}", sheet, name, e)))?;
        sheets.push(
            range
                .rows()
                .map(|row| row.iter().map(cell_text).collect())
                .collect::<Rows>(),
        );
    }
    if sheets.is_empty() {
        return Err(Error::Archive(format!("workbook {} has no sheets", name)));
    }

    let rows = sheets.swap_remove(heuristics::pick_sheet(&sheets));
    payload_from_rows(name, &rows)
}

/// Apply the header/participant/data heuristics to one sheet's rows.
pub fn payload_from_rows(name: &str, rows: &[Vec<String>]) -> Result<SpreadsheetPayload> {
    let participant_count =
        heuristics::find_participants(rows).map_err(|reason| Error::ParticipantsNotFound {
            file: name.to_string(),
            reason,
        })?;
    let header = heuristics::find_header(rows).ok_or_else(|| Error::HeaderNotFound {
        file: name.to_string(),
    })?;
    let data_rows = heuristics::collect_data_rows(rows, &header);
    if data_rows.is_empty() {
        return Err(Error::NoDataRows {
            file: name.to_string(),
        });
    }

    Ok(SpreadsheetPayload {
        source_filename: name.to_string(),
        participant_count,
        header_row: header.cells,
        data_rows,
    })
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive(entries: &[(&str, &[u8])]) -> ArchiveBytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();
        ArchiveBytes {
            resolved_url: "https://x.eu/GO.zip".into(),
            status_code: 200,
            raw_bytes: bytes,
        }
    }

    #[test]
    fn archive_without_spreadsheets_is_an_error() {
        let zip = archive(&[("readme.txt", b"hello"), ("__MACOSX/._a.xlsx", b"junk")]);
        let err = ZipWorkbookExtractor.extract(&zip).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }

    #[test]
    fn garbage_bytes_are_an_archive_error() {
        let bytes = ArchiveBytes {
            resolved_url: "https://x.eu/GO.zip".into(),
            status_code: 200,
            raw_bytes: b"<html>not a zip</html>".to_vec(),
        };
        assert!(matches!(ZipWorkbookExtractor.extract(&bytes), Err(Error::Archive(_))));
    }

    #[test]
    fn unreadable_workbook_surfaces_its_error() {
        let zip = archive(&[("August_2025.xlsx", b"not a workbook")]);
        let err = ZipWorkbookExtractor.extract(&zip).unwrap_err();
        assert!(err.to_string().contains("August_2025.xlsx"));
    }

    /// Cover sheet first, aggregated results on the second sheet with numeric cells.
    fn results_workbook() -> Vec<u8> {
        let mut workbook = rust_xlsxwriter::Workbook::new();

        let cover = workbook.add_worksheet();
        cover.set_name("Cover").unwrap();
        cover.write_string(0, 0, "Number of participants").unwrap();
        cover.write_number(0, 1, 5.0).unwrap();
        cover.write_string(1, 0, "Region").unwrap();
        cover.write_string(1, 1, "Technology").unwrap();
        cover.write_string(2, 0, "Wrong").unwrap();
        cover.write_string(2, 1, "Sheet").unwrap();

        let results = workbook.add_worksheet();
        results.set_name("Results").unwrap();
        results.write_string(0, 0, "Aggregated Auction Results").unwrap();
        results.write_string(1, 0, "Number of participants").unwrap();
        results.write_number(1, 1, 83.0).unwrap();
        results.write_string(3, 0, "Region").unwrap();
        results.write_string(3, 1, "Technology").unwrap();
        results.write_string(3, 2, "Volume auctioned").unwrap();
        results.write_string(4, 0, "Nordics").unwrap();
        results.write_string(4, 1, "Wind").unwrap();
        results.write_number(4, 2, 1200.5).unwrap();
        results.write_string(5, 0, "Iberia").unwrap();
        results.write_string(5, 1, "Solar").unwrap();
        results.write_number(5, 2, 900.0).unwrap();

        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn marker_sheet_is_read_from_a_real_workbook() {
        let book = results_workbook();
        let zip = archive(&[
            ("results/20251119_August_2025_83_GLOBAL_Results.xlsx", book.as_slice()),
            ("__MACOSX/results/._20251119_August_2025_83_GLOBAL_Results.xlsx", b"fork"),
        ]);

        let contents = ZipWorkbookExtractor.extract(&zip).unwrap();
        assert!(contents.skipped.is_empty());
        assert_eq!(contents.payloads.len(), 1);

        let payload = &contents.payloads[0];
        assert_eq!(payload.source_filename, "results/20251119_August_2025_83_GLOBAL_Results.xlsx");
        assert_eq!(payload.participant_count, 83);
        assert_eq!(payload.header_row, vec!["Region", "Technology", "Volume auctioned"]);
        assert_eq!(
            payload.data_rows,
            vec![vec!["Nordics", "Wind", "1200.5"], vec!["Iberia", "Solar", "900"]]
        );
    }

    #[test]
    fn lying_size_header_is_not_trusted() {
        let mut zip = archive(&[("August_2025.xlsx", b"not a workbook")]);
        // Central directory header: uncompressed size lives 24 bytes in.
        let cd = zip
            .raw_bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .unwrap();
        zip.raw_bytes[cd + 24..cd + 28].copy_from_slice(&0xFFFF_FFFEu32.to_le_bytes());

        let result = ZipWorkbookExtractor.extract(&zip);
        assert!(matches!(result, Err(Error::Archive(_))));
    }

    #[test]
    fn oversized_entry_is_refused() {
        let err = read_capped(std::io::repeat(0), "huge.xlsx", 1024).unwrap_err();
        assert!(err.to_string().contains("huge.xlsx is larger than 1024 bytes"));

        let small = read_capped(&b"tiny"[..], "small.xlsx", 1024).unwrap();
        assert_eq!(small, b"tiny");
    }

    #[test]
    fn entry_filter() {
        assert!(is_spreadsheet_entry("results/20251119_August_2025_83_GLOBAL_Results.xlsx"));
        assert!(is_spreadsheet_entry("OLD.XLS"));
        assert!(!is_spreadsheet_entry("__MACOSX/results.xlsx"));
        assert!(!is_spreadsheet_entry("results/~$open.xlsx"));
        assert!(!is_spreadsheet_entry("results/._resource.xlsx"));
        assert!(!is_spreadsheet_entry("results.csv"));
    }

    #[test]
    fn payload_errors_are_typed() {
        let no_header: Vec<Vec<String>> = vec![vec!["Number of participants".into(), "5".into()]];
        assert!(matches!(
            payload_from_rows("a.xlsx", &no_header),
            Err(Error::HeaderNotFound { .. })
        ));

        let no_rows: Vec<Vec<String>> = vec![
            vec!["Number of participants".into(), "5".into()],
            vec!["Region".into(), "Technology".into()],
        ];
        assert!(matches!(
            payload_from_rows("a.xlsx", &no_rows),
            Err(Error::NoDataRows { .. })
        ));

        let no_participants: Vec<Vec<String>> = vec![vec!["Region".into(), "Technology".into()]];
        assert!(matches!(
            payload_from_rows("a.xlsx", &no_participants),
            Err(Error::ParticipantsNotFound { .. })
        ));
    }

    #[test]
    fn payload_from_sheet_rows() {
        let rows: Vec<Vec<String>> = vec![
            vec!["Number of participants".into(), "83".into(), "".into()],
            vec!["Region".into(), "Technology".into(), "Sold".into()],
            vec!["Nordics".into(), "Wind".into(), "10".into()],
        ];
        let payload = payload_from_rows("August_2025.xlsx", &rows).unwrap();
        assert_eq!(payload.participant_count, 83);
        assert_eq!(payload.header_row.len(), 3);
        assert_eq!(payload.data_rows.len(), 1);
    }
}
