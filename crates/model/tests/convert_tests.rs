//! End-to-end conversion of a tiny Llama-style checkpoint
//!
//! The model has 4 attention heads, 2 key/value heads, hidden size 8 and head
//! size 2, so the fused projection is `[8, 4*2 + 2*2 + 2*2]` and every weight
//! splits evenly on two ranks.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::Dtype;
use shardconv_core::DType;
use shardconv_model::{convert_directory, ConvertConfig, FailureKind, ModelError};
use tempfile::TempDir;

const CONFIG_JSON: &str = r#"{
    "_name_or_path": "tiny-llama",
    "architectures": ["LlamaForCausalLM"],
    "hidden_size": 8,
    "intermediate_size": 16,
    "num_attention_heads": 4,
    "num_key_value_heads": 2,
    "num_hidden_layers": 1,
    "vocab_size": 6,
    "max_position_embeddings": 32,
    "rms_norm_eps": 1e-05,
    "bos_token_id": 1,
    "eos_token_id": 2
}"#;

struct Weight {
    name: &'static str,
    shape: Vec<usize>,
    values: Vec<f32>,
}

fn weight(name: &'static str, shape: &[usize], offset: f32) -> Weight {
    let n: usize = shape.iter().product();
    Weight {
        name,
        shape: shape.to_vec(),
        values: (0..n).map(|i| offset + i as f32).collect(),
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn read_f32(path: &Path) -> Vec<f32> {
    fs::read(path)
        .unwrap()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_safetensors(path: &Path, weights: &[Weight]) {
    let buffers: Vec<Vec<u8>> = weights.iter().map(|w| f32_bytes(&w.values)).collect();
    let views: Vec<(String, TensorView<'_>)> = weights
        .iter()
        .zip(&buffers)
        .map(|(w, data)| (w.name.to_string(), TensorView::new(Dtype::F32, w.shape.clone(), data).unwrap()))
        .collect();
    fs::write(path, safetensors::tensor::serialize(views, &None).unwrap()).unwrap();
}

fn tiny_model() -> Vec<Weight> {
    vec![
        weight("model.embed_tokens.weight", &[6, 8], 0.0),
        weight("model.layers.0.input_layernorm.weight", &[8], 0.5),
        weight("model.layers.0.self_attn.q_proj.weight", &[8, 8], 0.0),
        weight("model.layers.0.self_attn.k_proj.weight", &[4, 8], 100.0),
        weight("model.layers.0.self_attn.v_proj.weight", &[4, 8], 200.0),
        weight("model.layers.0.self_attn.o_proj.weight", &[8, 8], 300.0),
        weight("model.layers.0.self_attn.rotary_emb.inv_freq", &[1], 1.0),
        weight("model.layers.0.post_attention_layernorm.weight", &[8], 0.25),
        weight("model.layers.0.mlp.gate_proj.weight", &[16, 8], 400.0),
        weight("model.layers.0.mlp.up_proj.weight", &[16, 8], 600.0),
        weight("model.layers.0.mlp.down_proj.weight", &[8, 16], 800.0),
        weight("model.norm.weight", &[8], 2.0),
        weight("lm_head.weight", &[6, 8], 1000.0),
    ]
}

/// Model directory with the weights spread over two safetensors files
fn model_dir(weights: &[Weight]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config.json"), CONFIG_JSON).unwrap();
    let (first, second) = weights.split_at(weights.len() / 2);
    write_safetensors(&dir.path().join("model-00001-of-00002.safetensors"), first);
    write_safetensors(&dir.path().join("model-00002-of-00002.safetensors"), second);
    dir
}

fn bin_files(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".bin"))
        .collect()
}

fn config_for(input: &Path, output: &Path, factor: usize) -> ConvertConfig {
    ConvertConfig::new(input, output)
        .with_dtype(DType::F32)
        .with_factor(factor)
        .with_processes(2)
}

// =============================================================================
// File layout
// =============================================================================

#[test]
fn test_two_rank_file_set() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();

    let report = convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    let expected: BTreeSet<String> = [
        "model.wte.bin",
        "model.final_layernorm.weight.bin",
        "model.lm_head.weight.bin",
        "model.layers.0.input_layernorm.weight.bin",
        "model.layers.0.post_attention_layernorm.weight.bin",
        "model.layers.0.attention.query_key_value.weight.0.bin",
        "model.layers.0.attention.query_key_value.weight.1.bin",
        "model.layers.0.attention.dense.weight.0.bin",
        "model.layers.0.attention.dense.weight.1.bin",
        "model.layers.0.mlp.gate_proj.weight.0.bin",
        "model.layers.0.mlp.gate_proj.weight.1.bin",
        "model.layers.0.mlp.up_proj.weight.0.bin",
        "model.layers.0.mlp.up_proj.weight.1.bin",
        "model.layers.0.mlp.down_proj.weight.0.bin",
        "model.layers.0.mlp.down_proj.weight.1.bin",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    assert_eq!(bin_files(output.path()), expected);
    assert_eq!(report.files_written(), expected.len());
    assert_eq!(report.weights_written(), 10);
    assert!(output.path().join("config.ini").exists());
}

#[test]
fn test_replicated_weights_ignore_factor() {
    let input = model_dir(&tiny_model());

    for factor in [1, 2, 4] {
        let output = tempfile::tempdir().unwrap();
        // factor 4 cannot split 2 kv heads; norms are still written once
        convert_directory(&config_for(input.path(), output.path(), factor)).unwrap();
        let files = bin_files(output.path());
        assert!(files.contains("model.layers.0.input_layernorm.weight.bin"));
        assert!(!files.iter().any(|f| f.starts_with("model.layers.0.input_layernorm.weight.0")));
    }
}

// =============================================================================
// Shard contents
// =============================================================================

#[test]
fn test_fused_qkv_shard_contents() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();
    convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    // Checkpoint layout is [out, in]; element (o, i) of q is o*8 + i
    let q = |o: usize, i: usize| (o * 8 + i) as f32;
    let k = |o: usize, i: usize| 100.0 + (o * 8 + i) as f32;
    let v = |o: usize, i: usize| 200.0 + (o * 8 + i) as f32;

    for rank in 0..2 {
        let path = output
            .path()
            .join(format!("model.layers.0.attention.query_key_value.weight.{}.bin", rank));
        let shard = read_f32(&path);
        assert_eq!(shard.len(), 8 * 8);

        // Each input row: two query heads, then one key head and one value
        // head, each head two columns wide
        let expected: Vec<f32> = (0..8)
            .flat_map(|i| {
                let queries = (4 * rank..4 * rank + 4).map(move |o| q(o, i));
                let keys = (2 * rank..2 * rank + 2).map(move |o| k(o, i));
                let values = (2 * rank..2 * rank + 2).map(move |o| v(o, i));
                queries.chain(keys).chain(values)
            })
            .collect();
        assert_eq!(shard, expected, "rank {}", rank);
    }
}

#[test]
fn test_row_split_reassembles_transposed_weight() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();
    convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    // down_proj is [8, 16] in the checkpoint and [16, 8] after transposing
    let original: Vec<f32> = (0..128).map(|i| 800.0 + i as f32).collect();
    let transposed: Vec<f32> = (0..16)
        .flat_map(|i| (0..8).map(move |o| (o, i)))
        .map(|(o, i)| original[o * 16 + i])
        .collect();

    let mut reassembled = read_f32(&output.path().join("model.layers.0.mlp.down_proj.weight.0.bin"));
    reassembled.extend(read_f32(&output.path().join("model.layers.0.mlp.down_proj.weight.1.bin")));
    assert_eq!(reassembled, transposed);
}

#[test]
fn test_embedding_and_head_are_not_transposed() {
    let weights = tiny_model();
    let input = model_dir(&weights);
    let output = tempfile::tempdir().unwrap();
    convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    let embed = weights.iter().find(|w| w.name == "model.embed_tokens.weight").unwrap();
    assert_eq!(read_f32(&output.path().join("model.wte.bin")), embed.values);

    let head = weights.iter().find(|w| w.name == "lm_head.weight").unwrap();
    assert_eq!(read_f32(&output.path().join("model.lm_head.weight.bin")), head.values);
}

#[test]
fn test_half_precision_output() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();
    let config = config_for(input.path(), output.path(), 1).with_dtype(DType::F16);

    convert_directory(&config).unwrap();

    let bytes = fs::read(output.path().join("model.final_layernorm.weight.bin")).unwrap();
    assert_eq!(bytes.len(), 8 * 2);
    let values: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect();
    assert_eq!(values, vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);

    let ini = fs::read_to_string(output.path().join("config.ini")).unwrap();
    assert!(ini.contains("weight_data_type = fp16"));
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_unknown_weight_is_skipped() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();

    let report = convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "model.layers.0.self_attn.rotary_emb.inv_freq");
    assert_eq!(report.skipped[0].kind, FailureKind::Classification);
    assert!(!bin_files(output.path()).iter().any(|f| f.contains("inv_freq")));
}

#[test]
fn test_factor_cutting_kv_heads_is_skipped() {
    let input = model_dir(&tiny_model());
    let output = tempfile::tempdir().unwrap();

    // 8 query and 4 key/value columns divide by 4, but 2 kv heads do not
    let report = convert_directory(&config_for(input.path(), output.path(), 4)).unwrap();

    let qkv_skip = report
        .skipped
        .iter()
        .find(|s| s.name == "model.layers.0.self_attn.q_proj.weight")
        .unwrap();
    assert_eq!(qkv_skip.kind, FailureKind::Shape);
    assert!(qkv_skip.reason.contains("heads"), "{}", qkv_skip.reason);

    let files = bin_files(output.path());
    assert!(!files.iter().any(|f| f.contains("query_key_value")));
    assert!(files.contains("model.layers.0.mlp.up_proj.weight.3.bin"));
}

#[test]
fn test_single_kv_head_cannot_be_sharded() {
    let input = model_dir(&tiny_model());
    let config = CONFIG_JSON
        .replace("\"hidden_size\": 8", "\"hidden_size\": 12")
        .replace("\"num_attention_heads\": 4", "\"num_attention_heads\": 6")
        .replace("\"num_key_value_heads\": 2", "\"num_key_value_heads\": 1");
    fs::write(input.path().join("config.json"), config).unwrap();
    let output = tempfile::tempdir().unwrap();

    // 16 fused columns read as 6 query heads and 1 kv head of size 2: the
    // column widths split in two, the single kv head does not
    let report = convert_directory(&config_for(input.path(), output.path(), 2)).unwrap();

    let qkv_skip = report
        .skipped
        .iter()
        .find(|s| s.name == "model.layers.0.self_attn.q_proj.weight")
        .unwrap();
    assert_eq!(qkv_skip.kind, FailureKind::Shape);
    assert!(bin_files(output.path()).contains("model.layers.0.attention.dense.weight.1.bin"));
}

#[test]
fn test_missing_key_projection_is_fatal() {
    let weights: Vec<Weight> = tiny_model()
        .into_iter()
        .filter(|w| !w.name.contains("k_proj"))
        .collect();
    let input = model_dir(&weights);
    let output = tempfile::tempdir().unwrap();

    let err = convert_directory(&config_for(input.path(), output.path(), 2)).unwrap_err();
    assert!(matches!(err, ModelError::UnpairedProjection { .. }));
    assert!(bin_files(output.path()).is_empty());
}

#[test]
fn test_incomplete_config_is_fatal() {
    let input = model_dir(&tiny_model());
    fs::write(input.path().join("config.json"), r#"{"hidden_size": 4}"#).unwrap();
    let output = tempfile::tempdir().unwrap();

    let err = convert_directory(&config_for(input.path(), output.path(), 2)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::Source);
}
