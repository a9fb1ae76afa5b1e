//! Safetensors checkpoint loading
//!
//! A model directory holds `config.json` plus one or more `*.safetensors`
//! files. Files are memory-mapped and their headers parsed once at open;
//! tensor bytes are copied out only when a weight is requested.

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::SafeTensors;

use shardconv_core::{DType, NamedTensor};

use crate::config::ModelHyperparameters;
use crate::error::{ModelError, Result};
use crate::source::ModelSource;

/// Location of one tensor inside a mapped file
#[derive(Debug, Clone)]
struct TensorEntry {
    /// Index into `mmaps`
    file: usize,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    /// Byte range from the start of the file
    range: Range<usize>,
}

/// Memory-mapped safetensors checkpoint
pub struct SafetensorsLoader {
    /// Path to model directory
    model_dir: PathBuf,
    /// Model configuration
    config: ModelHyperparameters,
    /// Memory-mapped files, in file-name order
    mmaps: Vec<(String, Mmap)>,
    /// Tensor names in file order, then name order within a file
    names: Vec<String>,
    /// Tensor name to its location
    index: HashMap<String, TensorEntry>,
}

impl SafetensorsLoader {
    /// Open a directory containing config.json and *.safetensors files
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let model_dir = dir.as_ref().to_path_buf();
        if !model_dir.is_dir() {
            return Err(ModelError::ModelNotFound(model_dir.display().to_string()));
        }

        let config = ModelHyperparameters::from_json_file(model_dir.join("config.json"))?;
        config.validate()?;

        let files = list_safetensor_files(&model_dir)?;
        if files.is_empty() {
            return Err(ModelError::InvalidFormat(format!(
                "no .safetensors files in {}",
                model_dir.display()
            )));
        }

        let mut mmaps = Vec::with_capacity(files.len());
        let mut names = Vec::new();
        let mut index = HashMap::new();

        for (file_idx, path) in files.iter().enumerate() {
            let file = File::open(path)?;
            let mmap = unsafe { Mmap::map(&file)? };
            let filename = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());

            // 8-byte header length, JSON header, then the data section
            let (header_len, metadata) = SafeTensors::read_metadata(&mmap)
                .map_err(|e| ModelError::InvalidFormat(format!("{}: {}", filename, e)))?;
            let data_start = 8 + header_len;

            let mut file_tensors: Vec<_> = metadata.tensors().into_iter().collect();
            file_tensors.sort_by(|a, b| a.0.cmp(&b.0));

            for (name, info) in file_tensors {
                let (begin, end) = info.data_offsets;
                let range = data_start + begin..data_start + end;
                if range.end > mmap.len() {
                    return Err(ModelError::InvalidFormat(format!(
                        "{}: tensor {} ends at byte {} past the end of the file ({} bytes)",
                        filename,
                        name,
                        range.end,
                        mmap.len()
                    )));
                }

                let entry = TensorEntry {
                    file: file_idx,
                    dtype: info.dtype,
                    shape: info.shape.clone(),
                    range,
                };
                if index.insert(name.clone(), entry).is_some() {
                    return Err(ModelError::InvalidFormat(format!(
                        "tensor {} appears in more than one file",
                        name
                    )));
                }
                names.push(name);
            }

            tracing::debug!("Mapped {} ({} bytes)", filename, mmap.len());
            mmaps.push((filename, mmap));
        }

        tracing::info!(
            "Opened {} with {} tensors in {} safetensors files",
            model_dir.display(),
            names.len(),
            mmaps.len()
        );

        Ok(Self {
            model_dir,
            config,
            mmaps,
            names,
            index,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn num_files(&self) -> usize {
        self.mmaps.len()
    }
}

impl ModelSource for SafetensorsLoader {
    fn tensor_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn load_tensor(&self, name: &str) -> Result<NamedTensor> {
        let entry = self
            .index
            .get(name)
            .ok_or_else(|| ModelError::MissingWeight(name.to_string()))?;

        let dtype = match entry.dtype {
            safetensors::Dtype::F32 => DType::F32,
            safetensors::Dtype::F16 => DType::F16,
            safetensors::Dtype::BF16 => DType::BF16,
            safetensors::Dtype::I8 => DType::I8,
            dt => {
                return Err(ModelError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{:?}", dt),
                })
            }
        };

        let (_, mmap) = &self.mmaps[entry.file];
        let data = mmap[entry.range.clone()].to_vec();
        Ok(NamedTensor::new(name, entry.shape.clone(), dtype, data)?)
    }

    fn hyperparameters(&self) -> &ModelHyperparameters {
        &self.config
    }
}

/// List safetensor files in a model directory, sorted by name
pub fn list_safetensor_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "safetensors") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
