use std::{fs, path::Path};

use burn::{
    prelude::*,
    record::{HalfPrecisionSettings, NamedMpkBytesRecorder, Recorder},
};

use crate::error::Result;

/// Named MessagePack at half precision, held in memory so the caller owns the file name.
pub type WeightRecorder = NamedMpkBytesRecorder<HalfPrecisionSettings>;

/// Writes the weights of `module` to exactly `path`.
pub fn save_weights<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let bytes = Recorder::<B>::record(&WeightRecorder::default(), module.into_record(), ())?;
    fs::write(path, bytes)?;

    Ok(())
}

/// Loads weights written by [`save_weights`] into `module`.
pub fn load_weights<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    let bytes = fs::read(path)?;
    let record = Recorder::<B>::load(&WeightRecorder::default(), bytes, device)?;

    Ok(module.load_record(record))
}
