pub mod area;
pub mod boolean;
pub mod catalog;
pub mod dependencies;
pub mod error;
pub mod flags;
pub mod log;
pub mod routine;
pub mod schema;
pub mod session;

#[cfg(feature = "python")]
mod python;

pub use area::{AreaOverrideTable, AreaTimeResolver, Season};
pub use boolean::BooleanAccumulator;
pub use catalog::{RoutineCatalog, RoutineKind, Settings};
pub use dependencies::ParameterDependencies;
pub use error::{QcError, Result};
pub use flags::{Flag, FlagString};
pub use log::QcLog;
pub use routine::Routine;
pub use session::{FlagMatrix, ProfileDataset, RunSummary, SessionQC};

#[cfg(feature = "python")]
use pyo3::prelude::*;
#[cfg(feature = "python")]
use pyo3::types::PyModule;

/// Export schema constants as Python submodules
#[cfg(feature = "python")]
fn add_schema_exports(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Flag fields
    let flag_field = PyModule::new(m.py(), "flag_field")?;
    flag_field.add("AUTO_PREFIX", schema::flag_field::AUTO_PREFIX)?;
    flag_field.add("PRIMARY_PREFIX", schema::flag_field::PRIMARY_PREFIX)?;
    m.add_submodule(&flag_field)?;

    // Meta
    let meta = PyModule::new(m.py(), "meta")?;
    meta.add("LATITUDE_DD", schema::meta::LATITUDE_DD)?;
    meta.add("LONGITUDE_DD", schema::meta::LONGITUDE_DD)?;
    meta.add("MONTH", schema::meta::MONTH)?;
    meta.add("ALL", schema::meta::ALL.to_vec())?;
    m.add_submodule(&meta)?;

    // Area sheet
    let area_sheet = PyModule::new(m.py(), "area_sheet")?;
    area_sheet.add("PARAMETER", schema::area_sheet::PARAMETER)?;
    area_sheet.add("AREA_NAME", schema::area_sheet::AREA_NAME)?;
    area_sheet.add("SEASON", schema::area_sheet::SEASON)?;
    area_sheet.add("MONTHS", schema::area_sheet::MONTHS)?;
    m.add_submodule(&area_sheet)?;

    // Thresholds
    let threshold = PyModule::new(m.py(), "threshold")?;
    threshold.add("MIN_RANGE_VALUE", schema::threshold::MIN_RANGE_VALUE)?;
    threshold.add("MAX_RANGE_VALUE", schema::threshold::MAX_RANGE_VALUE)?;
    threshold.add("ACCEPTABLE_ERROR", schema::threshold::ACCEPTABLE_ERROR)?;
    threshold.add(
        "ACCEPTABLE_STDDEV_FACTOR",
        schema::threshold::ACCEPTABLE_STDDEV_FACTOR,
    )?;
    threshold.add("MIN_STDDEV_VALUE", schema::threshold::MIN_STDDEV_VALUE)?;
    threshold.add("Q_FLAG", schema::threshold::Q_FLAG)?;
    m.add_submodule(&threshold)?;

    Ok(())
}

#[cfg(feature = "python")]
#[pymodule]
fn profile_qc(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PySessionQC>()?;
    add_schema_exports(m)?;
    Ok(())
}
