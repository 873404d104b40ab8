use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use polars::prelude::*;
use serde_json::Value;
use tracing::debug;

use crate::catalog::Thresholds;
use crate::error::{QcError, Result};
use crate::flags::Flag;
use crate::schema::{area_sheet, threshold};

/// routine name → parameter → threshold override
pub type ResolvedOverrides = BTreeMap<String, BTreeMap<String, Thresholds>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    pub fn from_month(month: u32) -> Result<Self> {
        match month {
            12 | 1 | 2 => Ok(Season::Winter),
            3..=5 => Ok(Season::Spring),
            6..=8 => Ok(Season::Summer),
            9..=11 => Ok(Season::Autumn),
            other => Err(QcError::Argument(format!("invalid month {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Winter => "winter",
            Season::Spring => "spring",
            Season::Summer => "summer",
            Season::Autumn => "autumn",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Polygon in (longitude, latitude) with optional holes.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<(f64, f64)>,
    pub holes: Vec<Vec<(f64, f64)>>,
}

impl Polygon {
    pub fn new(exterior: Vec<(f64, f64)>) -> Self {
        Self {
            exterior,
            holes: Vec::new(),
        }
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        ring_contains(&self.exterior, lon, lat)
            && !self.holes.iter().any(|hole| ring_contains(hole, lon, lat))
    }
}

/// Even-odd ray casting.
fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[derive(Debug, Clone, PartialEq)]
pub struct Area {
    pub name: String,
    pub polygons: Vec<Polygon>,
}

impl Area {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.polygons.iter().any(|p| p.contains(lon, lat))
    }
}

/// Read areas from a GeoJSON FeatureCollection of Polygon / MultiPolygon
/// features, naming each area by `name_property` (e.g. `AREA_NAME`).
pub fn areas_from_geojson(json: &str, name_property: &str) -> Result<Vec<Area>> {
    let root: Value = serde_json::from_str(json)?;
    let features = root
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| QcError::InvalidData("GeoJSON has no 'features' array".into()))?;

    features
        .iter()
        .map(|feature| -> Result<Area> {
            let name = feature
                .get("properties")
                .and_then(|p| p.get(name_property))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    QcError::InvalidData(format!("feature without '{name_property}' property"))
                })?;
            let geometry = feature
                .get("geometry")
                .ok_or_else(|| QcError::InvalidData(format!("area '{name}' has no geometry")))?;
            let coordinates = geometry.get("coordinates").unwrap_or(&Value::Null);
            let polygons = match geometry.get("type").and_then(Value::as_str) {
                Some("Polygon") => vec![parse_polygon(coordinates)?],
                Some("MultiPolygon") => as_array(coordinates)?
                    .iter()
                    .map(parse_polygon)
                    .collect::<Result<Vec<_>>>()?,
                other => {
                    return Err(QcError::InvalidData(format!(
                        "area '{name}' has unsupported geometry {other:?}"
                    )))
                }
            };
            Ok(Area {
                name: name.to_string(),
                polygons,
            })
        })
        .collect()
}

fn as_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| QcError::InvalidData(format!("expected coordinate array, got {value}")))
}

fn parse_polygon(value: &Value) -> Result<Polygon> {
    let mut rings = as_array(value)?.iter().map(|ring| {
        as_array(ring)?
            .iter()
            .map(|point| {
                let xy = as_array(point)?;
                match (xy.first().and_then(Value::as_f64), xy.get(1).and_then(Value::as_f64)) {
                    (Some(x), Some(y)) => Ok((x, y)),
                    _ => Err(QcError::InvalidData(format!("invalid position {point}"))),
                }
            })
            .collect::<Result<Vec<_>>>()
    });
    let exterior = rings
        .next()
        .ok_or_else(|| QcError::InvalidData("polygon without rings".into()))??;
    let holes = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon { exterior, holes })
}

/// Override sheets, one polars frame per routine name.
///
/// Each sheet has `PARAMETER`, `AREA_NAME`, `SEASON`, optionally `MONTHS`
/// (`;`-separated), plus threshold columns named like the catalog fields.
#[derive(Debug, Clone, Default)]
pub struct AreaOverrideTable {
    sheets: BTreeMap<String, DataFrame>,
}

impl AreaOverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, routine: impl Into<String>, sheet: DataFrame) -> Result<()> {
        let routine = routine.into();
        for required in [area_sheet::PARAMETER, area_sheet::AREA_NAME, area_sheet::SEASON] {
            if sheet.column(required).is_err() {
                return Err(QcError::MissingColumn(format!("{required} in sheet '{routine}'")));
            }
        }
        self.sheets.insert(routine, sheet);
        Ok(())
    }

    /// Load a sheet from CSV with every column as a string.
    pub fn load_csv(&mut self, routine: impl Into<String>, path: &Path) -> Result<()> {
        let sheet = read_csv_as_strings(path)?;
        self.insert(routine, sheet)
    }

    /// Overrides for one area, season and month across all sheets.
    pub fn extract(&self, area: &str, season: Season, month: u32) -> Result<ResolvedOverrides> {
        let mut resolved = ResolvedOverrides::new();
        for (routine, sheet) in &self.sheets {
            let in_area = sheet
                .clone()
                .lazy()
                .filter(col(area_sheet::AREA_NAME).eq(lit(area)))
                .collect()?;

            let seasonal = in_area
                .clone()
                .lazy()
                .filter(col(area_sheet::SEASON).eq(lit(season.as_str())))
                .collect()?;
            let mut by_parameter = sheet_overrides(&seasonal)?;

            if in_area.column(area_sheet::MONTHS).is_ok() {
                let months = in_area
                    .column(area_sheet::MONTHS)?
                    .cast(&DataType::String)?;
                let mask: Vec<bool> = months
                    .str()?
                    .into_iter()
                    .map(|item| item.is_some_and(|m| month_list_contains(m, month)))
                    .collect();
                let monthly = in_area.filter(&BooleanChunked::from_slice("months".into(), &mask))?;
                by_parameter.extend(sheet_overrides(&monthly)?);
            }

            debug!(
                "{} overrides for {routine} in {area}/{season}/{month}",
                by_parameter.len()
            );
            resolved.insert(routine.clone(), by_parameter);
        }
        Ok(resolved)
    }
}

/// `"4;5; 6.0"` contains 5. Unparsable items are ignored.
fn month_list_contains(list: &str, month: u32) -> bool {
    list.split(';')
        .filter_map(|s| s.trim().parse::<f64>().ok())
        .any(|m| m as i64 == i64::from(month))
}

fn sheet_overrides(sheet: &DataFrame) -> Result<BTreeMap<String, Thresholds>> {
    let parameters = sheet
        .column(area_sheet::PARAMETER)?
        .cast(&DataType::String)?;
    let parameters = parameters.str()?;

    let value_columns: Vec<(String, Column)> = sheet
        .get_column_names_str()
        .into_iter()
        .filter(|name| !area_sheet::KEYS.contains(name))
        .map(|name| -> Result<(String, Column)> {
            Ok((name.to_ascii_lowercase(), sheet.column(name)?.cast(&DataType::String)?))
        })
        .collect::<Result<_>>()?;

    let mut overrides = BTreeMap::new();
    for i in 0..sheet.height() {
        let Some(parameter) = parameters.get(i) else {
            continue;
        };
        let mut thresholds = Thresholds::default();
        for (field, column) in &value_columns {
            let Some(raw) = column.str()?.get(i) else {
                continue;
            };
            set_threshold(&mut thresholds, field, raw)?;
        }
        overrides.insert(parameter.trim().to_string(), thresholds);
    }
    Ok(overrides)
}

/// Set one threshold from a sheet cell. Empty cells leave the field unset.
fn set_threshold(thresholds: &mut Thresholds, field: &str, raw: &str) -> Result<()> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(());
    }
    let number = || {
        raw.parse::<f64>()
            .map_err(|_| QcError::InvalidData(format!("'{raw}' is not a number for {field}")))
    };
    match field {
        threshold::MIN_RANGE_VALUE => thresholds.min_range_value = Some(number()?),
        threshold::MAX_RANGE_VALUE => thresholds.max_range_value = Some(number()?),
        threshold::ACCEPTABLE_ERROR => thresholds.acceptable_error = Some(number()?),
        threshold::ACCEPTABLE_STDDEV_FACTOR => thresholds.acceptable_stddev_factor = Some(number()?),
        threshold::MIN_STDDEV_VALUE => thresholds.min_stddev_value = Some(number()?),
        threshold::Q_FLAG => {
            let flag = raw
                .chars()
                .next()
                .and_then(Flag::from_char)
                .ok_or_else(|| QcError::InvalidData(format!("'{raw}' is not a flag")))?;
            thresholds.q_flag = Some(flag);
        }
        other => debug!("ignoring override column '{other}'"),
    }
    Ok(())
}

/// Read a CSV file with all columns as String dtype.
/// Trims whitespace from column names.
pub fn read_csv_as_strings(path: &Path) -> Result<DataFrame> {
    let mut df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0)) // all columns as String
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let trimmed: Vec<String> = df
        .get_column_names_str()
        .iter()
        .map(|c| c.trim().to_string())
        .collect();
    df.set_column_names(trimmed.as_slice())?;
    Ok(df)
}

/// Positions remembered by one resolver.
const AREA_CACHE_CAPACITY: usize = 128;

type Position = (u64, u64);

/// Area hits per position, oldest evicted first once full.
#[derive(Debug, Default)]
struct AreaCache {
    hits: HashMap<Position, usize>,
    order: VecDeque<Position>,
}

impl AreaCache {
    fn get(&self, key: &Position) -> Option<usize> {
        self.hits.get(key).copied()
    }

    fn insert(&mut self, key: Position, idx: usize) {
        if self.hits.insert(key, idx).is_some() {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > AREA_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.hits.remove(&oldest);
            }
        }
    }
}

/// Maps a cast position and month to area/season threshold overrides.
///
/// Areas and sheets are loaded once; area hits are memoised per position.
#[derive(Debug)]
pub struct AreaTimeResolver {
    areas: Vec<Area>,
    table: AreaOverrideTable,
    area_cache: Mutex<AreaCache>,
}

impl AreaTimeResolver {
    pub fn new(areas: Vec<Area>, table: AreaOverrideTable) -> Self {
        Self {
            areas,
            table,
            area_cache: Mutex::new(AreaCache::default()),
        }
    }

    /// Name of the first area containing the position.
    pub fn area_name(&self, lat: f64, lon: f64) -> Result<&str> {
        let key = (lat.to_bits(), lon.to_bits());
        let cached = self
            .area_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(&key));
        if let Some(idx) = cached {
            return Ok(&self.areas[idx].name);
        }

        let idx = self
            .areas
            .iter()
            .position(|area| area.contains(lon, lat))
            .ok_or(QcError::NoAreaFound { lat, lon })?;
        if let Ok(mut cache) = self.area_cache.lock() {
            cache.insert(key, idx);
        }
        Ok(&self.areas[idx].name)
    }

    pub fn resolve(&self, lat: f64, lon: f64, month: u32) -> Result<ResolvedOverrides> {
        let season = Season::from_month(month)?;
        let area = self.area_name(lat, lon)?;
        debug!("position ({lat}, {lon}) in area {area}, month {month} ({season})");
        self.table.extract(area, season, month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon {
        Polygon::new(vec![
            (x0, y0),
            (x0 + size, y0),
            (x0 + size, y0 + size),
            (x0, y0 + size),
            (x0, y0),
        ])
    }

    fn range_sheet() -> DataFrame {
        DataFrame::new(vec![
            Column::new("PARAMETER".into(), &["TEMP_CTD", "TEMP_CTD", "SALT_CTD", "TEMP_CTD"]),
            Column::new("AREA_NAME".into(), &["Kattegat", "Kattegat", "Kattegat", "Baltic Proper"]),
            Column::new("SEASON".into(), &["spring", "", "spring", "spring"]),
            Column::new("MONTHS".into(), &["", "4;5.0", "", ""]),
            Column::new("min_range_value".into(), &["-1", "", "", "0"]),
            Column::new("max_range_value".into(), &["18", "12", "35", "20"]),
        ])
        .unwrap()
    }

    fn resolver() -> AreaTimeResolver {
        let areas = vec![
            Area {
                name: "Kattegat".into(),
                polygons: vec![square(10.0, 55.0, 3.0)],
            },
            Area {
                name: "Baltic Proper".into(),
                polygons: vec![square(14.0, 54.0, 6.0)],
            },
        ];
        let mut table = AreaOverrideTable::new();
        table.insert("range_check", range_sheet()).unwrap();
        AreaTimeResolver::new(areas, table)
    }

    #[test]
    fn test_season_table() {
        assert_eq!(Season::from_month(1).unwrap(), Season::Winter);
        assert_eq!(Season::from_month(12).unwrap(), Season::Winter);
        assert_eq!(Season::from_month(4).unwrap(), Season::Spring);
        assert_eq!(Season::from_month(8).unwrap(), Season::Summer);
        assert_eq!(Season::from_month(10).unwrap(), Season::Autumn);
        assert!(Season::from_month(13).is_err());
    }

    #[test]
    fn test_polygon_with_hole() {
        let mut polygon = square(0.0, 0.0, 10.0);
        polygon.holes.push(square(4.0, 4.0, 2.0).exterior);
        assert!(polygon.contains(1.0, 1.0));
        assert!(!polygon.contains(5.0, 5.0));
        assert!(!polygon.contains(11.0, 1.0));
    }

    #[test]
    fn test_area_lookup() {
        let resolver = resolver();
        assert_eq!(resolver.area_name(56.0, 12.0).unwrap(), "Kattegat");
        assert_eq!(resolver.area_name(56.0, 12.0).unwrap(), "Kattegat");
        assert_eq!(resolver.area_name(55.0, 18.0).unwrap(), "Baltic Proper");
        assert!(matches!(
            resolver.area_name(70.0, 0.0),
            Err(QcError::NoAreaFound { .. })
        ));
    }

    #[test]
    fn test_area_cache_is_bounded() {
        let resolver = resolver();
        for i in 0..(AREA_CACHE_CAPACITY + 20) {
            let lon = 10.5 + i as f64 * 0.01;
            assert_eq!(resolver.area_name(56.0, lon).unwrap(), "Kattegat");
        }
        let cache = resolver.area_cache.lock().unwrap();
        assert_eq!(cache.hits.len(), AREA_CACHE_CAPACITY);
        assert_eq!(cache.order.len(), AREA_CACHE_CAPACITY);
        assert!(cache.get(&(56.0f64.to_bits(), 10.5f64.to_bits())).is_none());
    }

    #[test]
    fn test_month_rows_take_precedence() {
        let resolver = resolver();

        let april = resolver.resolve(56.0, 12.0, 4).unwrap();
        let temp = &april["range_check"]["TEMP_CTD"];
        assert_eq!(temp.max_range_value, Some(12.0));
        assert_eq!(temp.min_range_value, None);
        assert_eq!(april["range_check"]["SALT_CTD"].max_range_value, Some(35.0));

        let march = resolver.resolve(56.0, 12.0, 3).unwrap();
        let temp = &march["range_check"]["TEMP_CTD"];
        assert_eq!(temp.max_range_value, Some(18.0));
        assert_eq!(temp.min_range_value, Some(-1.0));

        let july = resolver.resolve(56.0, 12.0, 7).unwrap();
        assert!(july["range_check"].is_empty());
    }

    #[test]
    fn test_month_list_parsing() {
        assert!(month_list_contains("4;5.0; 6", 5));
        assert!(month_list_contains("4.0", 4));
        assert!(!month_list_contains("4;x", 5));
        assert!(!month_list_contains("", 1));
    }

    #[test]
    fn test_geojson_areas() {
        let json = r#"{
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"AREA_NAME": "Skagerrak"},
                 "geometry": {"type": "Polygon",
                              "coordinates": [[[8,57],[11,57],[11,59],[8,59],[8,57]]]}},
                {"type": "Feature", "properties": {"AREA_NAME": "Islands"},
                 "geometry": {"type": "MultiPolygon",
                              "coordinates": [[[[0,0],[1,0],[1,1],[0,1],[0,0]]],
                                              [[[5,5],[6,5],[6,6],[5,6],[5,5]]]]}}
            ]
        }"#;
        let areas = areas_from_geojson(json, "AREA_NAME").unwrap();
        assert_eq!(areas.len(), 2);
        assert!(areas[0].contains(9.5, 58.0));
        assert_eq!(areas[1].polygons.len(), 2);
        assert!(areas[1].contains(5.5, 5.5));
        assert!(areas_from_geojson(r#"{"features": [{"properties": {}}]}"#, "AREA_NAME").is_err());
    }
}
