use crate::WeightPrecision;
use ndarray::{ArrayD, IxDyn, ShapeError};
use ndarray_npy::{NpzReader, ReadNpzError};
use serde_json::{self, Value};
use std::io::{Cursor, Read, Seek};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

/// Key of the ordered parameter list in a JSON weight file.
pub const PARAM_VALUES_KEY: &str = "param values";

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict with key \"param values\" holding a list of {{\"shape\", \"values\"}} pairs)")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
    #[error("Weight file {0} has no supported extension (npz or json)")]
    WeightFileExtensionError(String),
}

/// Source of an ordered list of trainable parameters, as produced by
/// `get_all_param_values` on the network the weights were exported from.
pub trait WeightLoader {
    /// Returns all parameter arrays in declaration order (input to output).
    fn param_values(&mut self) -> WeightResult<Vec<ArrayD<WeightPrecision>>>;
}

pub struct JsonWeightLoader {
    content: Value,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        Self::from_json_str(&raw_file)
    }

    pub fn from_json_str(raw: &str) -> WeightResult<JsonWeightLoader> {
        let content: Value = serde_json::from_str(raw).map_err(|_| WeightError::WeightFormatError)?;
        if !content.is_object() {
            return Err(WeightError::WeightFormatError);
        }
        Ok(JsonWeightLoader { content })
    }
}

/// Parses a single `{"shape": [..], "values": [..]}` entry. Values are flattened in
/// row-major order.
fn json_entry_to_array(entry: &Value) -> WeightResult<ArrayD<WeightPrecision>> {
    let shape: Vec<usize> = entry
        .get("shape")
        .and_then(Value::as_array)
        .ok_or(WeightError::WeightFormatError)?
        .iter()
        .map(|d| {
            d.as_u64()
                .map(|v| v as usize)
                .ok_or(WeightError::WeightFormatError)
        })
        .collect::<WeightResult<_>>()?;

    let values: Vec<WeightPrecision> = entry
        .get("values")
        .and_then(Value::as_array)
        .ok_or(WeightError::WeightFormatError)?
        .iter()
        .map(|j| {
            j.as_f64()
                .map(|v| v as WeightPrecision)
                .ok_or(WeightError::WeightFormatError)
        })
        .collect::<WeightResult<_>>()?;

    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

impl WeightLoader for JsonWeightLoader {
    fn param_values(&mut self) -> WeightResult<Vec<ArrayD<WeightPrecision>>> {
        let raw_list = self
            .content
            .get(PARAM_VALUES_KEY)
            .ok_or_else(|| WeightError::WeightKeyError(PARAM_VALUES_KEY.to_string()))?;

        match raw_list {
            Value::Array(entries) => entries.iter().map(json_entry_to_array).collect(),
            _ => Err(WeightError::WeightFormatError),
        }
    }
}

/// Reads parameters from a numpy archive written with `np.savez(path, *param_values)`,
/// i.e. arrays named `arr_0`, `arr_1`, ... in declaration order.
pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let handle = std::fs::File::open(path)?;
        Ok(NpzWeightLoader { handle })
    }
}

impl<'a> NpzWeightLoader<Cursor<&'a [u8]>> {
    pub fn from_buffer(bytes_array: &'a [u8]) -> NpzWeightLoader<Cursor<&'a [u8]>> {
        NpzWeightLoader {
            handle: Cursor::new(bytes_array),
        }
    }
}

/// Position of an `arr_<n>` entry, tolerating the `.npy` suffix of the zip member.
fn positional_index(name: &str) -> Option<usize> {
    name.trim_end_matches(".npy")
        .strip_prefix("arr_")
        .and_then(|n| n.parse().ok())
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn param_values(&mut self) -> WeightResult<Vec<ArrayD<WeightPrecision>>> {
        let mut reader = NpzReader::new(&mut self.handle)?;

        let mut indexed = Vec::new();
        for name in reader.names()? {
            let index = positional_index(&name).ok_or(WeightError::WeightFormatError)?;
            indexed.push((index, name));
        }
        indexed.sort_by_key(|(index, _)| *index);

        let mut values = Vec::with_capacity(indexed.len());
        for (expected, (index, name)) in indexed.into_iter().enumerate() {
            // a gap means the archive is missing a parameter
            if index != expected {
                return Err(WeightError::WeightKeyError(format!("arr_{}", expected)));
            }
            let arr: ArrayD<WeightPrecision> = reader.by_name(&name)?;
            values.push(arr);
        }
        log::debug!("Read {} parameter arrays from npz archive", values.len());
        Ok(values)
    }
}

/// Opens a weight file, choosing the loader by extension (`npz` or `json`).
pub fn open_weights<P: AsRef<Path>>(path: P) -> WeightResult<Box<dyn WeightLoader>> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("npz") => Ok(Box::new(NpzWeightLoader::from_path(path)?)),
        Some("json") => Ok(Box::new(JsonWeightLoader::new(path)?)),
        _ => Err(WeightError::WeightFileExtensionError(
            path.display().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;
    use ndarray::{array, Array1, Array2};
    use tempfile::tempdir;

    #[test]
    fn test_json_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.json");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            // Rust escapes curly braces by doubling them
            "{{ \"param values\": [{{\"shape\": [3], \"values\": [0.0, 1e-3, 1.0]}}, \
             {{\"shape\": [2, 2], \"values\": [0.0, 1.0, 2.0, 3.0]}}]}}"
        )
        .unwrap();

        let mut loader = JsonWeightLoader::new(file_path).unwrap();
        let values = loader.param_values().unwrap();

        assert_eq!(values.len(), 2);
        assert_eq!(values[0], array![0.0, 1e-3, 1.0].into_dyn());
        assert_eq!(values[1], array![[0.0, 1.0], [2.0, 3.0]].into_dyn());

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_missing_key() {
        let mut loader = JsonWeightLoader::from_json_str("{\"weights\": []}").unwrap();
        assert!(matches!(
            loader.param_values(),
            Err(WeightError::WeightKeyError(k)) if k == PARAM_VALUES_KEY
        ));
    }

    #[test]
    fn test_json_wrong_shape() {
        let mut loader = JsonWeightLoader::from_json_str(
            "{\"param values\": [{\"shape\": [2, 2], \"values\": [1.0, 2.0, 3.0]}]}",
        )
        .unwrap();
        assert!(matches!(
            loader.param_values(),
            Err(WeightError::WeightShapeError(_))
        ));
    }

    #[test]
    fn test_npz_weight_loader_orders_numerically() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = ndarray_npy::NpzWriter::new(file);
        let arrays: Vec<Array1<f32>> = (0..12).map(|i| Array1::from_elem(1, i as f32)).collect();
        // written out of order, arr_10 sorts before arr_2 lexicographically
        for i in (0..12).rev() {
            let name = format!("arr_{}", i);
            npz.add_array(name.as_str(), &arrays[i]).unwrap();
        }
        npz.finish().unwrap();

        let mut loader = NpzWeightLoader::from_path(&file_path).unwrap();
        let values = loader.param_values().unwrap();

        assert_eq!(values.len(), 12);
        for (i, v) in values.iter().enumerate() {
            assert_eq!(v, &arrays[i].clone().into_dyn());
        }

        dir.close().unwrap();
    }

    #[test]
    fn test_npz_weight_loader_keeps_shapes() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = ndarray_npy::NpzWriter::new(file);
        let a: Array2<f32> = array![[1., 2., 3.], [4., 5., 6.]];
        let b: Array1<f32> = array![7., 8.];
        npz.add_array("arr_0", &a).unwrap();
        npz.add_array("arr_1", &b).unwrap();
        npz.finish().unwrap();

        let mut loader = open_weights(&file_path).unwrap();
        let values = loader.param_values().unwrap();

        assert_eq!(values[0], a.into_dyn());
        assert_eq!(values[1], b.into_dyn());

        dir.close().unwrap();
    }

    #[test]
    fn test_npz_weight_loader_from_buffer() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let mut npz = ndarray_npy::NpzWriter::new(File::create(&file_path).unwrap());
        npz.add_array("arr_1", &array![3f32, 4.]).unwrap();
        npz.add_array("arr_0", &array![[1f32], [2.]]).unwrap();
        npz.finish().unwrap();
        let bytes = std::fs::read(&file_path).unwrap();

        let mut loader = NpzWeightLoader::from_buffer(&bytes);
        let values = loader.param_values().unwrap();

        assert_eq!(values, vec![array![[1f32], [2.]].into_dyn(), array![3f32, 4.].into_dyn()]);

        dir.close().unwrap();
    }

    #[test]
    fn test_npz_gap_is_reported() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = ndarray_npy::NpzWriter::new(file);
        npz.add_array("arr_0", &array![1f32]).unwrap();
        npz.add_array("arr_2", &array![2f32]).unwrap();
        npz.finish().unwrap();

        let mut loader = NpzWeightLoader::from_path(&file_path).unwrap();
        assert!(matches!(
            loader.param_values(),
            Err(WeightError::WeightKeyError(k)) if k == "arr_1"
        ));

        dir.close().unwrap();
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            open_weights("/definitely/not/here/vgg19.npz"),
            Err(WeightError::WeightFileNotFoundError(_))
        ));
    }

    #[test]
    fn test_unknown_extension() {
        assert!(matches!(
            open_weights("vgg19_normalized.pkl"),
            Err(WeightError::WeightFileExtensionError(_))
        ));
    }
}
