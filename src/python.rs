use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use pyo3::prelude::*;
use pyo3_polars::PyDataFrame;

use crate::area::{areas_from_geojson, AreaOverrideTable, AreaTimeResolver};
use crate::catalog::{RoutineCatalog, Settings};
use crate::dependencies::ParameterDependencies;
use crate::error::QcError;
use crate::session::{ProfileDataset, SessionQC};

#[pyclass(name = "SessionQC")]
pub struct PySessionQC {
    session: SessionQC,
}

#[pymethods]
impl PySessionQC {
    /// Build a session from a routine catalog YAML file.
    ///
    /// Args:
    ///     catalog: path to the routine catalog
    ///     areas: GeoJSON file with the named QC areas (optional)
    ///     area_property: feature property holding the area name
    ///     override_sheets: routine name -> CSV path with area/season thresholds
    ///     dependencies: JSON file of parameter derivations (default CTD table if omitted)
    #[new]
    #[pyo3(signature = (catalog, areas=None, area_property="AREA_NAME", override_sheets=None, dependencies=None))]
    fn new(
        catalog: PathBuf,
        areas: Option<PathBuf>,
        area_property: &str,
        override_sheets: Option<HashMap<String, PathBuf>>,
        dependencies: Option<PathBuf>,
    ) -> PyResult<Self> {
        let catalog = RoutineCatalog::from_yaml_str(&read_text(&catalog)?)?;
        let mut settings = Settings::new(catalog);

        if let Some(areas) = areas {
            let areas = areas_from_geojson(&read_text(&areas)?, area_property)?;
            let mut table = AreaOverrideTable::new();
            for (routine, path) in override_sheets.unwrap_or_default() {
                table.load_csv(routine, &path)?;
            }
            settings = settings.with_resolver(AreaTimeResolver::new(areas, table));
        }

        let dependencies = match dependencies {
            Some(path) => ParameterDependencies::from_json_str(&read_text(&path)?)?,
            None => ParameterDependencies::default(),
        };

        Ok(Self {
            session: SessionQC::new(settings).with_dependencies(dependencies),
        })
    }

    /// Run all routines on one profile.
    ///
    /// Returns the data with updated flag columns and the metadata lines with
    /// the QC comment appended.
    #[pyo3(signature = (data, metadata, name, parameter_mapping=None))]
    fn run(
        &mut self,
        data: PyDataFrame,
        metadata: Vec<String>,
        name: &str,
        parameter_mapping: Option<HashMap<String, String>>,
    ) -> PyResult<(PyDataFrame, Vec<String>)> {
        let mut dataset = ProfileDataset::new(name, data.0)
            .with_metadata(metadata)
            .with_parameter_mapping(parameter_mapping.unwrap_or_default());
        self.session.run(&mut dataset)?;
        Ok((PyDataFrame(dataset.data), dataset.metadata))
    }

    /// Apply area and season thresholds for the position and month of the profile.
    fn update_routines(&mut self, data: PyDataFrame) -> PyResult<()> {
        let dataset = ProfileDataset::new("", data.0);
        self.session.update_routines(&dataset)?;
        Ok(())
    }

    #[pyo3(signature = (path, reset_log=true))]
    fn write_log(&mut self, path: PathBuf, reset_log: bool) -> PyResult<()> {
        self.session.write_log(&path, reset_log)?;
        Ok(())
    }

    fn reset_log(&mut self) {
        self.session.reset_log();
    }

    fn log_yaml(&self) -> PyResult<String> {
        Ok(self.session.log().to_yaml()?)
    }

    #[getter]
    fn number_of_routines(&self) -> usize {
        self.session.settings().number_of_routines()
    }
}

fn read_text(path: &Path) -> Result<String, QcError> {
    Ok(fs::read_to_string(path)?)
}
