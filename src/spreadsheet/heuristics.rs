//! Marker-based detection over untyped rows. Nothing here assumes fixed
//! column positions; everything works on plain `Vec<Vec<String>>`.

pub type Rows = Vec<Vec<String>>;

pub const AGGREGATED_MARKER: &str = "aggregated auction results";
pub const PARTICIPANTS_LABEL: &str = "number of participants";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRow {
    pub index: usize,
    pub cells: Vec<String>,
    pub region_col: usize,
    pub technology_col: usize,
}

pub fn contains_marker(rows: &[Vec<String>], marker: &str) -> bool {
    rows.iter()
        .flatten()
        .any(|cell| cell.to_lowercase().contains(marker))
}

/// Index of the first sheet carrying the aggregated-results title, else 0.
pub fn pick_sheet(sheets: &[Rows]) -> usize {
    sheets
        .iter()
        .position(|rows| contains_marker(rows, AGGREGATED_MARKER))
        .unwrap_or(0)
}

/// Participant count from the cell right of the "number of participants"
/// label. The error string says what went wrong.
pub fn find_participants(rows: &[Vec<String>]) -> Result<i64, String> {
    for row in rows {
        let Some(i) = row
            .iter()
            .position(|cell| cell.to_lowercase().contains(PARTICIPANTS_LABEL))
        else {
            continue;
        };
        let value = row.get(i + 1).map(|v| v.trim()).unwrap_or("");
        if value.is_empty() {
            return Err("participants value is empty".into());
        }
        let count = parse_count(value).ok_or_else(|| format!("participants value {:?} is not an integer", value))?;
        if count <= 0 {
            return Err(format!("participants value {} is not positive", count));
        }
        return Ok(count);
    }
    Err("participants label not found".into())
}

fn parse_count(value: &str) -> Option<i64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if let Ok(n) = cleaned.parse::<i64>() {
        return Some(n);
    }
    // Numeric cells can surface as "12.0".
    let f = cleaned.parse::<f64>().ok()?;
    (f.fract() == 0.0 && f.is_finite()).then_some(f as i64)
}

/// First row holding both a "region" and a "technology" cell.
pub fn find_header(rows: &[Vec<String>]) -> Option<HeaderRow> {
    rows.iter().enumerate().find_map(|(index, row)| {
        let col = |needle: &str| row.iter().position(|c| c.to_lowercase().contains(needle));
        let region_col = col("region")?;
        let technology_col = col("technology")?;
        Some(HeaderRow {
            index,
            cells: row.clone(),
            region_col,
            technology_col,
        })
    })
}

/// Contiguous data block under the header. Leading blank rows are skipped;
/// once a row has been taken, a blank row or blank key cell ends the block.
pub fn collect_data_rows(rows: &[Vec<String>], header: &HeaderRow) -> Rows {
    let width = header.cells.len();
    let mut data = Vec::new();

    for row in rows.iter().skip(header.index + 1) {
        let row = fit_width(row, width);
        let blank_key = |col: usize| row.get(col).map_or(true, |c| c.trim().is_empty());
        let usable = !is_blank(&row) && !blank_key(header.region_col) && !blank_key(header.technology_col);

        if usable {
            data.push(row);
        } else if !data.is_empty() {
            break;
        }
    }

    data
}

fn fit_width(row: &[String], width: usize) -> Vec<String> {
    let mut fitted: Vec<String> = row.iter().take(width).cloned().collect();
    fitted.resize(width, String::new());
    fitted
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(raw: &[&[&str]]) -> Rows {
        raw.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn sheet() -> Rows {
        rows(&[
            &["Aggregated Auction Results", "", "", ""],
            &["Number of participants", "83", "", ""],
            &["", "", "", ""],
            &["Region", "Technology", "Volume auctioned", "Volume sold"],
            &["", "", "", ""],
            &["Nordics", "Wind", "1 200,5", "1 000"],
            &["Iberia", "Solar", "900", "-"],
            &["", "", "", ""],
            &["Region", "Technology", "Notes", ""],
            &["Nordics", "Hydro", "other table", ""],
        ])
    }

    #[test]
    fn marker_sheet_is_preferred_over_first() {
        let cover = rows(&[&["Cover page"]]);
        let detail = rows(&[&["Detailed results"]]);
        assert_eq!(pick_sheet(&[cover.clone(), sheet()]), 1);
        assert_eq!(pick_sheet(&[cover, detail]), 0);
    }

    #[test]
    fn participants_from_adjacent_cell() {
        assert_eq!(find_participants(&sheet()), Ok(83));
        assert_eq!(find_participants(&rows(&[&["number of PARTICIPANTS:", "1 024"]])), Ok(1024));
        assert_eq!(find_participants(&rows(&[&["Number of participants", "12.0"]])), Ok(12));
    }

    #[test]
    fn participants_failures() {
        assert!(find_participants(&rows(&[&["Region", "Technology"]])).is_err());
        assert!(find_participants(&rows(&[&["Number of participants"]])).is_err());
        assert!(find_participants(&rows(&[&["Number of participants", "many"]])).is_err());
        assert!(find_participants(&rows(&[&["Number of participants", "0"]])).is_err());
    }

    #[test]
    fn header_detection_records_key_columns() {
        let header = find_header(&rows(&[
            &["title"],
            &["Volume", "Bidding region", "Production technology"],
        ]))
        .unwrap();
        assert_eq!(header.index, 1);
        assert_eq!(header.region_col, 1);
        assert_eq!(header.technology_col, 2);

        assert!(find_header(&rows(&[&["Region only"], &["Technology only"]])).is_none());
    }

    #[test]
    fn data_block_stops_at_first_gap() {
        let sheet = sheet();
        let header = find_header(&sheet).unwrap();
        let data = collect_data_rows(&sheet, &header);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], vec!["Nordics", "Wind", "1 200,5", "1 000"]);
        assert_eq!(data[1][0], "Iberia");
    }

    #[test]
    fn blank_key_cell_ends_the_block() {
        let sheet = rows(&[
            &["Region", "Technology", "Volume"],
            &["Nordics", "Wind", "10"],
            &["Total", "", "10"],
            &["Iberia", "Solar", "5"],
        ]);
        let header = find_header(&sheet).unwrap();
        let data = collect_data_rows(&sheet, &header);
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn short_rows_are_padded_to_header_width() {
        let sheet = rows(&[&["Region", "Technology", "Volume"], &["Nordics", "Wind"]]);
        let header = find_header(&sheet).unwrap();
        let data = collect_data_rows(&sheet, &header);
        assert_eq!(data, vec![vec!["Nordics".to_string(), "Wind".into(), String::new()]]);
    }

    #[test]
    fn header_without_data_yields_nothing() {
        let sheet = rows(&[&["Region", "Technology"], &["", ""]]);
        let header = find_header(&sheet).unwrap();
        assert!(collect_data_rows(&sheet, &header).is_empty());
    }
}
