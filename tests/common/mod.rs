//! Fixtures shared by the integration tests: a tiny Whisper-shaped base
//! model directory and a matching PEFT adapter directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use merge_lora_rs::store::TensorMap;

pub const Q_PROJ: &str = "model.encoder.layers.0.self_attn.q_proj.weight";
pub const V_PROJ: &str = "model.encoder.layers.0.self_attn.v_proj.weight";
pub const Q_BIAS: &str = "model.encoder.layers.0.self_attn.q_proj.bias";
pub const CONV1: &str = "model.encoder.conv1.weight";
pub const FC1: &str = "model.decoder.layers.0.fc1.weight";

pub const PREPROCESSOR: &str = r#"{
  "chunk_length": 30,
  "feature_extractor_type": "WhisperFeatureExtractor",
  "feature_size": 80,
  "hop_length": 160,
  "n_fft": 400,
  "padding_side": "right",
  "padding_value": 0.0,
  "processor_class": "WhisperProcessor",
  "return_attention_mask": false,
  "sampling_rate": 16000
}"#;

pub const TOKENIZER_CONFIG: &str = r#"{
  "add_prefix_space": false,
  "bos_token": "<|endoftext|>",
  "eos_token": "<|endoftext|>",
  "model_max_length": 1024,
  "processor_class": "WhisperProcessor",
  "tokenizer_class": "WhisperTokenizer",
  "unk_token": "<|endoftext|>"
}"#;

pub const VOCAB: &str = r#"{"<|endoftext|>": 0, "hello": 1, "world": 2}"#;
pub const MERGES: &str = "#version: 0.2\nh e\nw o\n";

/// Deterministic, non-trivial values so merged weights differ from the base.
fn ramp(shape: &[usize], offset: f32) -> Tensor {
    let n: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let data: Vec<f32> = (0..n).map(|i| offset + (i as f32) * 0.125).collect();
    Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
}

pub fn base_tensors() -> TensorMap {
    let mut tensors = TensorMap::new();
    tensors.insert(Q_PROJ.into(), ramp(&[4, 4], -1.0));
    tensors.insert(V_PROJ.into(), ramp(&[4, 4], 0.5));
    tensors.insert(Q_BIAS.into(), ramp(&[4], 0.0));
    tensors.insert(CONV1.into(), ramp(&[4, 2, 3], 0.25));
    tensors.insert(FC1.into(), ramp(&[8, 4], -0.75));
    tensors
}

/// Write a base model directory named `name` under `root`.
pub fn write_base_model(root: &Path, name: &str) -> PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();

    let tensors = base_tensors();
    safetensors::tensor::serialize_to_file(
        tensors.iter().map(|(k, v)| (k.as_str(), v)),
        &None,
        &dir.join("model.safetensors"),
    )
    .unwrap();

    fs::write(
        dir.join("config.json"),
        r#"{"model_type": "whisper", "d_model": 4, "encoder_layers": 1, "decoder_layers": 1}"#,
    )
    .unwrap();
    fs::write(
        dir.join("generation_config.json"),
        r#"{"max_length": 448, "decoder_start_token_id": 0}"#,
    )
    .unwrap();
    fs::write(dir.join("preprocessor_config.json"), PREPROCESSOR).unwrap();
    fs::write(dir.join("tokenizer_config.json"), TOKENIZER_CONFIG).unwrap();
    fs::write(dir.join("vocab.json"), VOCAB).unwrap();
    fs::write(dir.join("merges.txt"), MERGES).unwrap();
    dir
}

fn peft_name(layer: &str, factor: &str) -> String {
    let module = layer.strip_suffix(".weight").unwrap();
    format!("base_model.model.{module}.{factor}.weight")
}

/// Write an adapter directory targeting q_proj, v_proj and fc1 with rank 2.
pub fn write_adapter(root: &Path, base_model: &str, lora_alpha: f64) -> PathBuf {
    write_adapter_with(root, base_model, lora_alpha, &adapter_factors())
}

pub fn adapter_factors() -> HashMap<String, Tensor> {
    let mut factors = HashMap::new();
    for (layer, out_features, offset) in [(Q_PROJ, 4, 0.1f32), (V_PROJ, 4, -0.2), (FC1, 8, 0.3)] {
        factors.insert(peft_name(layer, "lora_A"), ramp(&[2, 4], offset));
        factors.insert(peft_name(layer, "lora_B"), ramp(&[out_features, 2], -offset));
    }
    factors
}

pub fn write_adapter_with(
    root: &Path,
    base_model: &str,
    lora_alpha: f64,
    factors: &HashMap<String, Tensor>,
) -> PathBuf {
    let dir = root.join("checkpoint-final");
    fs::create_dir_all(&dir).unwrap();

    let config = serde_json::json!({
        "peft_type": "LORA",
        "base_model_name_or_path": base_model,
        "r": 2,
        "lora_alpha": lora_alpha,
        "lora_dropout": 0.1,
        "target_modules": ["q_proj", "v_proj", "fc1"],
        "bias": "none",
        "inference_mode": true
    });
    fs::write(
        dir.join("adapter_config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let mut sorted: Vec<(&String, &Tensor)> = factors.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    safetensors::tensor::serialize_to_file(
        sorted.into_iter().map(|(k, v)| (k.as_str(), v)),
        &None,
        &dir.join("adapter_model.safetensors"),
    )
    .unwrap();
    dir
}

/// Expected merged weight for one layer: `W + scale · B · A`.
pub fn expected_layer(base: &Tensor, layer: &str, scale: f64) -> Tensor {
    let factors = adapter_factors();
    let a = &factors[&peft_name(layer, "lora_A")];
    let b = &factors[&peft_name(layer, "lora_B")];
    (base + (b.matmul(a).unwrap() * scale).unwrap()).unwrap()
}

pub fn to_vec(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

pub fn assert_close(actual: &Tensor, expected: &Tensor) {
    assert_eq!(actual.dims(), expected.dims());
    for (a, e) in to_vec(actual).iter().zip(to_vec(expected)) {
        assert!((a - e).abs() < 1e-5, "{a} != {e}");
    }
}

/// Every file in `dir` with its contents, sorted by name.
pub fn read_dir_files(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().into_owned(),
                fs::read(entry.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}
