//! NIfTI → normalized NPZ tensor.

use crate::error::ConvertError;
use crate::orientation::{affine_from_header, reorient_to_canonical};
use camino::Utf8Path;
use ndarray::{ArrayD, Axis, IxDyn};
use ndarray_npy::{NpzReader, NpzWriter};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

/// Rewrite a NIfTI volume as a compressed `.npz` tensor in the display
/// convention: supine axial with head-first slice order.
///
/// After nearest-canonical (RAS) reorientation, reversing X gives
/// right-to-left rows, reversing Y anterior-to-posterior columns, reversing Z
/// superior-to-inferior slices; the transpose puts the tensor in `(Z, Y, X)`
/// order.
pub(crate) fn normalize_and_save_npz(
    nii_path: &Utf8Path,
    npz_path: &Utf8Path,
) -> Result<(), ConvertError> {
    let object = ReaderOptions::new().read_file(nii_path.as_std_path())?;
    let header = object.header().clone();
    let volume = object.into_volume().into_ndarray::<f32>()?;
    let affine = affine_from_header(&header);
    let (mut data, _) = reorient_to_canonical(volume, affine);

    let spatial_axes = data.ndim().min(3);
    for axis in 0..spatial_axes {
        data.invert_axis(Axis(axis));
    }
    if data.ndim() >= 3 {
        let mut perm: Vec<usize> = (0..data.ndim()).collect();
        perm.swap(0, 2);
        data = data.permuted_axes(IxDyn(&perm));
    }

    let file = fs_err::File::create(npz_path)?;
    let mut npz = NpzWriter::new_compressed(file);
    npz.add_array("data", &data.as_standard_layout())?;
    npz.finish()?;
    Ok(())
}

/// Load the tensor back, e.g. for quality control or previews.
pub(crate) fn load_npz(npz_path: &Utf8Path) -> Result<ArrayD<f32>, ConvertError> {
    let file = fs_err::File::open(npz_path)?;
    let mut npz = NpzReader::new(file)?;
    Ok(npz.by_name("data.npy")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::header_with_affine;
    use crate::volume::write_nifti;
    use camino::Utf8PathBuf;
    use ndarray::{Array2, Array3};

    // A voxel at the front-top-right corner of an RAS volume must land at
    // index [0, 0, 0] of the normalized tensor.
    #[test]
    fn canonicalization_moves_front_top_right_to_origin() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let nii = dir.join("probe.nii.gz");
        let npz = dir.join("probe.npz");

        // x: right, y: anterior, z: superior
        let mut volume = Array3::<f32>::zeros((4, 5, 6));
        volume[[3, 4, 5]] = 42.0;
        let affine = Array2::<f64>::eye(4);
        write_nifti(&nii, volume.into_dyn(), affine).unwrap();

        normalize_and_save_npz(&nii, &npz).unwrap();
        let tensor = load_npz(&npz).unwrap();
        assert_eq!(tensor.shape(), &[6, 5, 4]);
        assert_eq!(tensor[[0, 0, 0]], 42.0);
        assert_eq!(tensor[[5, 4, 3]], 0.0);
    }

    #[test]
    fn header_round_trips_affine() {
        let mut affine = Array2::<f64>::eye(4);
        affine[[0, 3]] = -12.5;
        affine[[1, 1]] = 0.5;
        let header = header_with_affine(&affine);
        let back = affine_from_header(&header);
        assert_eq!(back[[0, 3]], -12.5);
        assert_eq!(back[[1, 1]], 0.5);
    }
}
