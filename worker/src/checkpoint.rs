use std::{
    fs, io,
    path::{Path, PathBuf},
};

use safetensors::tensor::{Dtype, TensorView};
use seg_core::SegModel;

/// Serializes the model's named tensors under a step-keyed path.
///
/// Rank 0 only; no barrier is needed around the call since the snapshot
/// reads this rank's already-synchronized parameters. A failed write is for
/// the caller to log, training continues without the checkpoint.
pub fn save_model<M: SegModel>(dir: &Path, step: usize, model: &M) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let state = model.state_dict();
    let mut views = Vec::with_capacity(state.len());
    for tensor in &state {
        let view = TensorView::new(
            Dtype::F32,
            tensor.shape.clone(),
            bytemuck::cast_slice(tensor.data),
        )
        .map_err(io::Error::other)?;
        views.push((tensor.name.to_string(), view));
    }

    let bytes = safetensors::serialize(views, &None).map_err(io::Error::other)?;
    let path = dir.join(format!("iteration_{step}_model_final.safetensors"));
    fs::write(&path, bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use safetensors::SafeTensors;
    use seg_core::PixelClassifier;

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("segtrain-ckpt-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn snapshot_roundtrips_through_safetensors() {
        let dir = scratch_dir("roundtrip");
        let model = PixelClassifier::new(3, 4, 7).unwrap();

        let path = save_model(&dir, 20_000, &model).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "iteration_20000_model_final.safetensors"
        );

        let raw = fs::read(&path).unwrap();
        let loaded = SafeTensors::deserialize(&raw).unwrap();
        let weight = loaded.tensor("weight").unwrap();
        assert_eq!(weight.shape(), &[4, 3]);

        let state = model.state_dict();
        let expected: &[u8] = bytemuck::cast_slice(state[0].data);
        assert_eq!(weight.data(), expected);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unwritable_directory_surfaces_the_error() {
        let model = PixelClassifier::new(2, 2, 1).unwrap();
        let err = save_model(Path::new("/proc/no-such-dir"), 0, &model);
        assert!(err.is_err());
    }
}
