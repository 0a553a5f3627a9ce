// Dataset module
// Materializes the benchmark workload from a JSON-lines stream
//
// Each line is one request:
//   {"task_id": 0, "prompt": "...", "output_tokens": 128}
//   {"task_id": 1, "input_ids": [1, 2, 3], "output_tokens": 64}
//   {"task_id": 2, "prompt": "...", "media_paths": ["a.png"], "output_tokens": 32}

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::PathBuf;

use crate::bench::record::RequestRecord;
use crate::error::{BenchError, Result};
use crate::tokenizer;

/// Non-text payload classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Video,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Image => write!(f, "image"),
            Modality::Video => write!(f, "video"),
        }
    }
}

/// Multimodal part of a request; its token cost is only known after execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultimodalPayload {
    pub modality: Modality,
    pub prompt: String,
    pub media_paths: Vec<String>,
}

/// One workload unit
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub input_ids: Vec<u32>,
    pub output_tokens: u32,
    pub multimodal: Option<MultimodalPayload>,
}

impl Request {
    /// Create a text request from token ids
    pub fn new(id: u64, input_ids: Vec<u32>, output_tokens: u32) -> Self {
        Self {
            id,
            input_ids,
            output_tokens,
            multimodal: None,
        }
    }

    /// Number of prompt tokens known before execution
    pub fn input_len(&self) -> u32 {
        self.input_ids.len() as u32
    }

    pub fn is_multimodal(&self) -> bool {
        self.multimodal.is_some()
    }
}

/// Statistics of the loaded workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub dataset_path: Option<PathBuf>,
    pub num_requests: usize,
    pub avg_isl: f64,
    pub avg_osl: f64,
    pub avg_sequence_length: f64,
    pub max_isl: u32,
    pub max_osl: u32,
    pub max_sequence_length: u32,
    pub modality: Option<Modality>,
}

impl DatasetMetadata {
    /// Derive metadata from (input length, output length) pairs
    fn from_lengths(
        lengths: impl Iterator<Item = (u32, u32)>,
        dataset_path: Option<PathBuf>,
        modality: Option<Modality>,
    ) -> Self {
        let mut count = 0usize;
        let (mut sum_isl, mut sum_osl) = (0u64, 0u64);
        let (mut max_isl, mut max_osl, mut max_seq) = (0u32, 0u32, 0u32);

        for (isl, osl) in lengths {
            count += 1;
            sum_isl += isl as u64;
            sum_osl += osl as u64;
            max_isl = max_isl.max(isl);
            max_osl = max_osl.max(osl);
            max_seq = max_seq.max(isl.saturating_add(osl));
        }

        let avg = |sum: u64| {
            if count == 0 {
                0.0
            } else {
                sum as f64 / count as f64
            }
        };

        Self {
            dataset_path,
            num_requests: count,
            avg_isl: avg(sum_isl),
            avg_osl: avg(sum_osl),
            avg_sequence_length: avg(sum_isl + sum_osl),
            max_isl,
            max_osl,
            max_sequence_length: max_seq,
            modality,
        }
    }

    /// Derive metadata from materialized requests.
    ///
    /// Multimodal requests carry no token ids, so their input length is
    /// estimated with `multimodal_isl`.
    pub fn from_requests(
        requests: &[Request],
        modality: Option<Modality>,
        multimodal_isl: u32,
    ) -> Self {
        let lengths = requests.iter().map(|r| {
            let isl = if r.is_multimodal() {
                multimodal_isl
            } else {
                r.input_len()
            };
            (isl, r.output_tokens)
        });
        Self::from_lengths(lengths, None, modality)
    }

    /// Recompute lengths from what the backend actually consumed and produced.
    ///
    /// Used for multimodal runs, where the pre-run input lengths are estimates.
    pub fn corrected_from(&self, records: &[RequestRecord]) -> Self {
        let lengths = records
            .iter()
            .filter(|r| r.is_success())
            .filter_map(|r| r.reported_input_tokens.map(|input| (input, r.output_tokens)));
        let mut corrected = Self::from_lengths(lengths, self.dataset_path.clone(), self.modality);
        if corrected.num_requests == 0 {
            tracing::warn!("Backend reported no prompt lengths, keeping estimated input lengths");
            return self.clone();
        }
        corrected.num_requests = self.num_requests;
        corrected
    }

    /// Printable dataset table
    pub fn summary(&self) -> String {
        let path = self
            .dataset_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<stdin>".to_string());
        let modality = self
            .modality
            .map(|m| m.to_string())
            .unwrap_or_else(|| "text".to_string());

        format!(
            "\n===========================================================\n\
             = DATASET DETAILS\n\
             ===========================================================\n\
             Dataset Path:         {}\n\
             Modality:             {}\n\
             Number of Sequences:  {}\n\
             \n\
             -- Percentiles statistics ---------------------------------\n\
             \n\
             Average ISL:          {:.4}\n\
             Average OSL:          {:.4}\n\
             Average Sequence:     {:.4}\n\
             Max ISL:              {}\n\
             Max OSL:              {}\n\
             Max Sequence Length:  {}\n\
             ===========================================================\n",
            path,
            modality,
            self.num_requests,
            self.avg_isl,
            self.avg_osl,
            self.avg_sequence_length,
            self.max_isl,
            self.max_osl,
            self.max_sequence_length,
        )
    }
}

/// One line of the dataset file
#[derive(Debug, Deserialize)]
struct DatasetEntry {
    task_id: u64,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    input_ids: Option<Vec<u32>>,
    output_tokens: u32,
    #[serde(default)]
    media_paths: Vec<String>,
}

/// Options for materializing a dataset
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Cap on the number of requests; 0 reads the whole stream
    pub num_requests: usize,
    pub modality: Option<Modality>,
    /// Estimated input length for multimodal requests
    pub max_input_seq_len_for_multimodal: u32,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            num_requests: 0,
            modality: None,
            max_input_seq_len_for_multimodal: 4096,
        }
    }
}

/// Load requests and metadata from a JSON-lines stream
pub fn load_dataset<R: BufRead>(
    reader: R,
    options: &DatasetOptions,
) -> Result<(DatasetMetadata, Vec<Request>)> {
    let mut requests = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        if options.num_requests > 0 && requests.len() >= options.num_requests {
            break;
        }

        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: DatasetEntry = serde_json::from_str(&line)
            .map_err(|e| BenchError::Dataset(format!("line {}: {}", line_no + 1, e)))?;
        requests.push(materialize(entry, options, line_no + 1)?);
    }

    if requests.is_empty() {
        return Err(BenchError::Dataset("dataset contains no requests".to_string()));
    }

    let metadata = DatasetMetadata::from_requests(
        &requests,
        options.modality,
        options.max_input_seq_len_for_multimodal,
    );

    tracing::debug!(
        requests = requests.len(),
        max_sequence_length = metadata.max_sequence_length,
        "Loaded dataset"
    );

    Ok((metadata, requests))
}

fn materialize(entry: DatasetEntry, options: &DatasetOptions, line_no: usize) -> Result<Request> {
    if entry.output_tokens == 0 {
        return Err(BenchError::Dataset(format!(
            "line {}: output_tokens must be at least 1",
            line_no
        )));
    }

    if let Some(modality) = options.modality {
        // Vision tokens are produced by the backend's preprocessor, so the
        // prompt is passed through untokenized.
        let prompt = entry.prompt.ok_or_else(|| {
            BenchError::Dataset(format!(
                "line {}: multimodal requests need a prompt",
                line_no
            ))
        })?;
        return Ok(Request {
            id: entry.task_id,
            input_ids: Vec::new(),
            output_tokens: entry.output_tokens,
            multimodal: Some(MultimodalPayload {
                modality,
                prompt,
                media_paths: entry.media_paths,
            }),
        });
    }

    let input_ids = match (entry.input_ids, entry.prompt) {
        (Some(ids), _) => ids,
        (None, Some(prompt)) => tokenizer::encode(&prompt)?,
        (None, None) => {
            return Err(BenchError::Dataset(format!(
                "line {}: request needs either prompt or input_ids",
                line_no
            )))
        }
    };

    if input_ids.is_empty() {
        return Err(BenchError::Dataset(format!(
            "line {}: request has an empty prompt",
            line_no
        )));
    }

    Ok(Request::new(entry.task_id, input_ids, entry.output_tokens))
}

/// Sample a warmup subset (with replacement) from the workload
pub fn generate_warmup_dataset(requests: &[Request], count: usize) -> Vec<Request> {
    let mut rng = rand::thread_rng();
    (0..count)
        .filter_map(|_| requests.choose(&mut rng).cloned())
        .collect()
}
