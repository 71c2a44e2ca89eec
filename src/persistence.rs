use std::path::Path;

use json::JsonValue;
use nalgebra::DVector;
use tracing::{info, warn};

use crate::{
    error::{DamflowError, Result},
    params::{InputParameters, ParameterStudy, Permeability},
    solver::SolutionField,
};

/// Version written into every saved model file
pub const MODEL_VERSION: i64 = 7;

/// Contents of a model file
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub params: InputParameters,
    pub study: Option<ParameterStudy>,
    /// Nodal results of an earlier solve, if they were saved
    pub results: Option<SolutionField>,
}

/// Outcome of reading a model file. A record that could not be mapped onto
/// the current parameters leaves `record` empty and explains why in
/// `warnings`; it is not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub record: Option<ModelRecord>,
    pub warnings: Vec<String>,
}

/// Reads a model file from disk
///
/// # Arguments
/// * `path` - The path to the model file
pub fn load_model(path: &Path) -> Result<LoadedModel> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            return Err(DamflowError::Input(format!(
                "Unable to open model file {}: {err}",
                path.display()
            )))
        }
    };

    let loaded = parse_model(&contents)?;
    for warning in &loaded.warnings {
        warn!("{}: {warning}", path.display());
    }
    Ok(loaded)
}

/// Writes a model file as pretty printed json
pub fn save_model(path: &Path, record: &ModelRecord) -> Result<()> {
    std::fs::write(path, to_json(record).pretty(4))?;
    info!("saved model to {}", path.display());
    Ok(())
}

/// Parses the text of a model file. Only malformed json is an error.
pub fn parse_model(contents: &str) -> Result<LoadedModel> {
    let model_json = match json::parse(contents) {
        Ok(j) => j,
        Err(err) => {
            return Err(DamflowError::Input(format!(
                "Error in model file json: {err}"
            )))
        }
    };

    if !model_json.is_object() {
        return Err(DamflowError::Input(
            "Model file must contain a json object".to_owned(),
        ));
    }

    let mut warnings = Vec::new();

    match model_json["version"].as_i64() {
        Some(MODEL_VERSION) => {}
        Some(version) => warnings.push(format!(
            "model file is from version {version}, current version is {MODEL_VERSION}; \
             values are mapped where possible"
        )),
        None => warnings.push(format!(
            "model file has no version, assuming fields of version {MODEL_VERSION}"
        )),
    }

    let params = match parse_params(&model_json) {
        Ok(p) => p,
        Err(reason) => {
            warnings.push(format!("parameters could not be mapped: {reason}"));
            return Ok(LoadedModel {
                record: None,
                warnings,
            });
        }
    };

    if let Err(err) = params.validate() {
        warnings.push(format!("stored parameters are not usable: {err}"));
        return Ok(LoadedModel {
            record: None,
            warnings,
        });
    }

    let study = match parse_study(&model_json) {
        Ok(Some(study)) => match study.validate(&params) {
            Ok(()) => Some(study),
            Err(err) => {
                warnings.push(format!("stored parameter study ignored: {err}"));
                None
            }
        },
        Ok(None) => None,
        Err(reason) => {
            warnings.push(format!("stored parameter study ignored: {reason}"));
            None
        }
    };

    let results = match parse_results(&model_json["results"]) {
        Ok(r) => r,
        Err(reason) => {
            warnings.push(format!("stored results ignored: {reason}"));
            None
        }
    };

    Ok(LoadedModel {
        record: Some(ModelRecord {
            params,
            study,
            results,
        }),
        warnings,
    })
}

fn number(model_json: &JsonValue, key: &str) -> std::result::Result<f64, String> {
    model_json[key]
        .as_f64()
        .ok_or_else(|| format!("missing or non-numeric field {key}"))
}

fn parse_params(model_json: &JsonValue) -> std::result::Result<InputParameters, String> {
    // older files carry a single isotropic k
    let permeability = if model_json.has_key("kx") || model_json.has_key("ky") {
        Permeability {
            kx: number(model_json, "kx")?,
            ky: number(model_json, "ky")?,
        }
    } else {
        Permeability::isotropic(number(model_json, "k")?)
    };

    let slice_thickness = match &model_json["ep"] {
        JsonValue::Null => 1.0,
        JsonValue::Array(values) => values
            .first()
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| "field ep holds no number".to_owned())?,
        other => other
            .as_f64()
            .ok_or_else(|| "field ep is not a number".to_owned())?,
    };

    Ok(InputParameters {
        width: number(model_json, "w")?,
        height: number(model_json, "h")?,
        depth: number(model_json, "d")?,
        thickness: number(model_json, "t")?,
        pressure: number(model_json, "p")?,
        permeability,
        slice_thickness,
        element_size: number(model_json, "el_size_factor")?,
    })
}

fn parse_study(model_json: &JsonValue) -> std::result::Result<Option<ParameterStudy>, String> {
    if !model_json.has_key("steps") {
        return Ok(None);
    }

    let steps = model_json["steps"]
        .as_usize()
        .ok_or_else(|| "field steps is not a non-negative integer".to_owned())?;
    let depth_study = model_json["dStudy"]
        .as_bool()
        .ok_or_else(|| "field dStudy is not a boolean".to_owned())?;

    let study = if depth_study {
        ParameterStudy::Depth {
            end: number(model_json, "dEnd")?,
            steps,
        }
    } else {
        ParameterStudy::Thickness {
            end: number(model_json, "tEnd")?,
            steps,
        }
    };
    Ok(Some(study))
}

fn parse_vector(values: &JsonValue, key: &str) -> std::result::Result<DVector<f64>, String> {
    if !values.is_array() {
        return Err(format!("{key} is not an array"));
    }
    let numbers = values
        .members()
        .map(JsonValue::as_f64)
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| format!("{key} holds a non-numeric entry"))?;
    Ok(DVector::from_vec(numbers))
}

fn parse_results(results_json: &JsonValue) -> std::result::Result<Option<SolutionField>, String> {
    if results_json.is_null() {
        return Ok(None);
    }

    let head = parse_vector(&results_json["head"], "head")?;
    let reaction = parse_vector(&results_json["reaction"], "reaction")?;
    if head.len() != reaction.len() {
        return Err(format!(
            "{} heads but {} reactions",
            head.len(),
            reaction.len()
        ));
    }

    Ok(Some(SolutionField { head, reaction }))
}

/// Json representation of a model record, keyed like the model file
pub fn to_json(record: &ModelRecord) -> JsonValue {
    let params = &record.params;
    let mut model_json = JsonValue::new_object();

    model_json["version"] = MODEL_VERSION.into();
    model_json["w"] = params.width.into();
    model_json["h"] = params.height.into();
    model_json["d"] = params.depth.into();
    model_json["t"] = params.thickness.into();
    model_json["p"] = params.pressure.into();
    model_json["kx"] = params.permeability.kx.into();
    model_json["ky"] = params.permeability.ky.into();
    model_json["ep"] = vec![params.slice_thickness].into();
    model_json["el_size_factor"] = params.element_size.into();

    match record.study {
        Some(ParameterStudy::Depth { end, steps }) => {
            model_json["dStudy"] = true.into();
            model_json["dEnd"] = end.into();
            model_json["steps"] = steps.into();
        }
        Some(ParameterStudy::Thickness { end, steps }) => {
            model_json["dStudy"] = false.into();
            model_json["tEnd"] = end.into();
            model_json["steps"] = steps.into();
        }
        None => {}
    }

    if let Some(results) = &record.results {
        let mut results_json = JsonValue::new_object();
        results_json["head"] = results.head.iter().copied().collect::<Vec<f64>>().into();
        results_json["reaction"] = results
            .reaction
            .iter()
            .copied()
            .collect::<Vec<f64>>()
            .into();
        model_json["results"] = results_json;
    }

    model_json
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSION_7: &str = r#"{
        "version": 7,
        "w": 50.0, "h": 10.0, "d": 2.0, "t": 1.0, "p": 10.0,
        "kx": 20.0, "ky": 10.0,
        "ep": [1.0],
        "el_size_factor": 1.0,
        "dStudy": true, "dEnd": 8.0, "tEnd": 10.0,
        "steps": 10
    }"#;

    #[test]
    fn reads_current_version() {
        let loaded = parse_model(VERSION_7).unwrap();
        assert!(loaded.warnings.is_empty());

        let record = loaded.record.unwrap();
        assert_eq!(record.params.permeability, Permeability { kx: 20.0, ky: 10.0 });
        assert_eq!(record.params.slice_thickness, 1.0);
        assert_eq!(record.study, Some(ParameterStudy::Depth { end: 8.0, steps: 10 }));
        assert!(record.results.is_none());
    }

    #[test]
    fn saved_record_reads_back() {
        let record = ModelRecord {
            params: InputParameters {
                permeability: Permeability { kx: 3.0, ky: 2.0 },
                slice_thickness: 0.5,
                ..Default::default()
            },
            study: Some(ParameterStudy::Thickness { end: 10.0, steps: 4 }),
            results: Some(SolutionField {
                head: DVector::from_vec(vec![10.0, 4.5, 0.0]),
                reaction: DVector::from_vec(vec![1.5, 0.0, -1.5]),
            }),
        };

        let loaded = parse_model(&to_json(&record).pretty(4)).unwrap();
        assert!(loaded.warnings.is_empty());
        assert_eq!(loaded.record, Some(record));
    }

    #[test]
    fn older_version_maps_isotropic_k_with_warning() {
        let contents = r#"{
            "version": 5,
            "w": 20.0, "h": 8.0, "d": 3.0, "t": 2.0, "p": 6.0,
            "k": 15.0, "ep": 2.0, "el_size_factor": 0.5
        }"#;
        let loaded = parse_model(contents).unwrap();

        assert_eq!(loaded.warnings.len(), 1);
        let record = loaded.record.unwrap();
        assert_eq!(record.params.permeability, Permeability::isotropic(15.0));
        assert_eq!(record.params.slice_thickness, 2.0);
        assert!(record.study.is_none());
    }

    #[test]
    fn unmappable_record_is_a_warning() {
        let loaded = parse_model(r#"{ "version": 3, "width": 50 }"#).unwrap();
        assert!(loaded.record.is_none());
        assert_eq!(loaded.warnings.len(), 2);

        // d >= h violates the geometry
        let loaded = parse_model(&VERSION_7.replace("\"d\": 2.0", "\"d\": 12.0")).unwrap();
        assert!(loaded.record.is_none());
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn invalid_study_is_dropped_but_parameters_kept() {
        let loaded = parse_model(&VERSION_7.replace("\"dEnd\": 8.0", "\"dEnd\": 40.0")).unwrap();
        let record = loaded.record.unwrap();
        assert!(record.study.is_none());
        assert_eq!(loaded.warnings.len(), 1);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            parse_model("{ \"w\": "),
            Err(DamflowError::Input(_))
        ));
        assert!(matches!(parse_model("[1, 2]"), Err(DamflowError::Input(_))));
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("damflow-no-such-model.json");
        assert!(matches!(load_model(&path), Err(DamflowError::Input(_))));
    }
}
