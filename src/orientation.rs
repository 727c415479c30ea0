//! Voxel-to-world geometry: affine construction, LPS→RAS conversion, and
//! nearest-canonical reorientation.

use ndarray::{Array2, ArrayD, Axis, IxDyn};
use nifti::NiftiHeader;

pub(crate) fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub(crate) fn norm3(v: [f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// Affine from patient-coordinate (LPS) geometry, converted to RAS.
///
/// Columns of the LPS matrix are the direction cosines scaled by their
/// spacing, plus the position of the first voxel; left-multiplying by
/// `diag(-1, -1, 1, 1)` flips into RAS.
pub(crate) fn affine_from_patient_geometry(
    row_cosine: [f64; 3],
    col_cosine: [f64; 3],
    slice_cosine: [f64; 3],
    position: [f64; 3],
    row_spacing: f64,
    col_spacing: f64,
    slice_spacing: f64,
) -> Array2<f64> {
    let mut affine = Array2::<f64>::eye(4);
    for r in 0..3 {
        affine[[r, 0]] = row_cosine[r] * row_spacing;
        affine[[r, 1]] = col_cosine[r] * col_spacing;
        affine[[r, 2]] = slice_cosine[r] * slice_spacing;
        affine[[r, 3]] = position[r];
    }
    let flip = [-1.0, -1.0, 1.0];
    for r in 0..2 {
        for c in 0..4 {
            affine[[r, c]] *= flip[r];
        }
    }
    affine
}

/// Affine built directly from RAS axis vectors, for 2-D projections whose
/// geometry comes from `PatientOrientation` codes rather than
/// `ImageOrientationPatient`.
pub(crate) fn affine_from_ras_axes(
    row_axis: [f64; 3],
    col_axis: [f64; 3],
    slice_axis: [f64; 3],
    origin: [f64; 3],
    row_spacing: f64,
    col_spacing: f64,
    slice_spacing: f64,
) -> Array2<f64> {
    let mut affine = Array2::<f64>::eye(4);
    for r in 0..3 {
        affine[[r, 0]] = row_axis[r] * row_spacing;
        affine[[r, 1]] = col_axis[r] * col_spacing;
        affine[[r, 2]] = slice_axis[r] * slice_spacing;
        affine[[r, 3]] = origin[r];
    }
    affine
}

/// Signed RAS unit vector for one `PatientOrientation` code.
pub(crate) fn patient_orientation_vector(code: &str) -> Option<[f64; 3]> {
    match code.trim() {
        "R" => Some([1.0, 0.0, 0.0]),
        "L" => Some([-1.0, 0.0, 0.0]),
        "A" => Some([0.0, 1.0, 0.0]),
        "P" => Some([0.0, -1.0, 0.0]),
        "H" => Some([0.0, 0.0, 1.0]),
        "F" => Some([0.0, 0.0, -1.0]),
        _ => None,
    }
}

/// Slice normal (row × col) from the 6-element ImageOrientationPatient.
pub(crate) fn slice_normal(iop: &[f64]) -> Option<[f64; 3]> {
    if iop.len() < 6 {
        return None;
    }
    let row = [iop[0], iop[1], iop[2]];
    let col = [iop[3], iop[4], iop[5]];
    Some(cross(row, col))
}

/// Affine recorded in a NIfTI header; sform when set, else spacing along the
/// identity axes.
pub(crate) fn affine_from_header(header: &NiftiHeader) -> Array2<f64> {
    let mut affine = Array2::<f64>::eye(4);
    if header.sform_code > 0 {
        for (r, row) in [header.srow_x, header.srow_y, header.srow_z]
            .into_iter()
            .enumerate()
        {
            for c in 0..4 {
                affine[[r, c]] = row[c] as f64;
            }
        }
    } else {
        for r in 0..3 {
            affine[[r, r]] = header.pixdim[r + 1].max(f32::MIN_POSITIVE) as f64;
        }
    }
    affine
}

/// Header carrying `affine` as an sform, with pixdim set to the column norms.
pub(crate) fn header_with_affine(affine: &Array2<f64>) -> NiftiHeader {
    let mut srow = [[0.0f32; 4]; 3];
    let mut pixdim = [1.0f32; 8];
    for r in 0..3 {
        for c in 0..4 {
            srow[r][c] = affine[[r, c]] as f32;
        }
    }
    for c in 0..3 {
        let col = [affine[[0, c]], affine[[1, c]], affine[[2, c]]];
        pixdim[c + 1] = norm3(col) as f32;
    }
    NiftiHeader {
        sform_code: 1,
        qform_code: 0,
        srow_x: srow[0],
        srow_y: srow[1],
        srow_z: srow[2],
        pixdim,
        ..NiftiHeader::default()
    }
}

/// Reorder and flip voxel axes so each advances along its closest positive
/// world axis (RAS-like), returning the matching affine.
pub(crate) fn reorient_to_canonical(
    mut data: ArrayD<f32>,
    mut affine: Array2<f64>,
) -> (ArrayD<f32>, Array2<f64>) {
    if data.ndim() < 3 {
        return (data, affine);
    }

    // dominant world axis per voxel axis; greedy, each world axis used once
    let mut assignment = [0usize; 3];
    let mut used = [false; 3];
    for j in 0..3 {
        let mut best = (usize::MAX, -1.0f64);
        for i in 0..3 {
            let magnitude = affine[[i, j]].abs();
            if !used[i] && magnitude > best.1 {
                best = (i, magnitude);
            }
        }
        assignment[j] = best.0;
        used[best.0] = true;
    }

    // flip axes that advance along a negative world direction
    for j in 0..3 {
        let i = assignment[j];
        if affine[[i, j]] < 0.0 {
            let extent = data.len_of(Axis(j)) as f64 - 1.0;
            for r in 0..3 {
                affine[[r, 3]] += affine[[r, j]] * extent;
                affine[[r, j]] = -affine[[r, j]];
            }
            data.invert_axis(Axis(j));
        }
    }

    // permute so voxel axis k advances along world axis k
    let mut perm: Vec<usize> = (0..data.ndim()).collect();
    for world in 0..3 {
        perm[world] = assignment
            .iter()
            .position(|&axis| axis == world)
            .expect("every world axis is assigned");
    }
    if perm[..3] != [0, 1, 2] {
        data = data.permuted_axes(IxDyn(&perm));
        let old = affine.clone();
        for k in 0..3 {
            for r in 0..3 {
                affine[[r, k]] = old[[r, perm[k]]];
            }
        }
    }
    (data, affine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    #[test]
    fn patient_geometry_affine_matches_scaled_cosines() {
        let row = [1.0, 0.0, 0.0];
        let col = [0.0, 1.0, 0.0];
        let normal = cross(row, col);
        let affine =
            affine_from_patient_geometry(row, col, normal, [10.0, -20.0, 5.0], 0.5, 0.7, 2.0);
        // undo the RAS flip to recover the LPS columns
        let flip = [-1.0, -1.0, 1.0];
        for r in 0..3 {
            assert_abs_diff_eq!(affine[[r, 0]] * flip[r], row[r] * 0.5, epsilon = 1e-9);
            assert_abs_diff_eq!(affine[[r, 1]] * flip[r], col[r] * 0.7, epsilon = 1e-9);
            assert_abs_diff_eq!(affine[[r, 2]] * flip[r], normal[r] * 2.0, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(affine[[0, 3]], -10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(affine[[1, 3]], 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(affine[[2, 3]], 5.0, epsilon = 1e-9);
    }

    #[test]
    fn canonical_reorientation_flips_negative_axes() {
        // voxel x axis runs along world -x
        let mut affine = Array2::<f64>::eye(4);
        affine[[0, 0]] = -1.0;
        let mut data = Array3::<f32>::zeros((3, 2, 2));
        data[[0, 0, 0]] = 7.0;
        let (canonical, canonical_affine) = reorient_to_canonical(data.into_dyn(), affine);
        assert_eq!(canonical[[2, 0, 0]], 7.0);
        assert_abs_diff_eq!(canonical_affine[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(canonical_affine[[0, 3]], -2.0, epsilon = 1e-12);
    }

    #[test]
    fn canonical_reorientation_permutes_axes() {
        // voxel axes ordered (y, z, x) in world terms
        let mut affine = Array2::<f64>::zeros((4, 4));
        affine[[1, 0]] = 1.0;
        affine[[2, 1]] = 1.0;
        affine[[0, 2]] = 1.0;
        affine[[3, 3]] = 1.0;
        let mut data = Array3::<f32>::zeros((2, 3, 4));
        data[[1, 2, 3]] = 9.0;
        let (canonical, canonical_affine) = reorient_to_canonical(data.into_dyn(), affine);
        assert_eq!(canonical.shape(), &[4, 2, 3]);
        assert_eq!(canonical[[3, 1, 2]], 9.0);
        for k in 0..3 {
            assert_abs_diff_eq!(canonical_affine[[k, k]], 1.0, epsilon = 1e-12);
        }
    }
}
