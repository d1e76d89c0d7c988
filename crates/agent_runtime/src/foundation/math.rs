//! Math utilities and types
//!
//! Provides the vector, quaternion and matrix primitives the entity graph
//! is built on, plus the orientation helpers used by `look_at`/`rotate_to`.

pub use nalgebra::{
    Vector3, Vector4,
    Matrix3, Matrix4,
    Quaternion,
    Unit,
};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// World up axis used when building look rotations
pub fn world_up() -> Vec3 {
    Vec3::new(0.0, 1.0, 0.0)
}

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a transform from its three components
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { position, rotation, scale }
    }

    /// Convert to a transformation matrix (translate * rotate * scale)
    ///
    /// A local point `p` maps to `position + rotation * (scale ⊙ p)`.
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }

    /// Decompose a TRS matrix back into a transform
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let position = extract_translation(matrix);

        let scale_x = Vec3::new(matrix.m11, matrix.m21, matrix.m31).magnitude();
        let scale_y = Vec3::new(matrix.m12, matrix.m22, matrix.m32).magnitude();
        let scale_z = Vec3::new(matrix.m13, matrix.m23, matrix.m33).magnitude();
        let scale = Vec3::new(scale_x, scale_y, scale_z);

        Self {
            position,
            rotation: extract_rotation(matrix),
            scale,
        }
    }
}

/// Translation column of an affine matrix
pub fn extract_translation(matrix: &Mat4) -> Vec3 {
    Vec3::new(matrix.m14, matrix.m24, matrix.m34)
}

/// Rotation part of an affine matrix with the column scale divided out
pub fn extract_rotation(matrix: &Mat4) -> Quat {
    let mut basis: Mat3 = matrix.fixed_view::<3, 3>(0, 0).into_owned();
    for mut column in basis.column_iter_mut() {
        let length = column.norm();
        if length > 0.0 {
            column /= length;
        }
    }
    orthonormal_to_quat(basis)
}

/// Shepperd-style conversion; exact for half-turns, unlike the iterative
/// `Quat::from_matrix` which stalls when seeded 180° away.
fn orthonormal_to_quat(basis: Mat3) -> Quat {
    Quat::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(basis))
}

/// Orthonormal basis whose third column is `direction`, built like a
/// camera frame: `right = up × direction`, `up' = direction × right`.
fn basis_from(direction: &Vec3, up: &Vec3) -> Mat3 {
    let mut right = up.cross(direction);
    if right.norm_squared() == 0.0 {
        // direction parallel to up, nudge it off the axis
        let nudged = direction.add_scalar(f32::EPSILON);
        right = up.cross(&nudged);
    }
    let right = right.normalize();
    let perpendicular_up = direction.cross(&right).normalize();
    Mat3::from_columns(&[right, perpendicular_up, *direction])
}

/// Rotation that turns `local_forward` (with `local_up`) to face
/// `target_direction`, using [`world_up`] as the secondary axis.
///
/// Both directions are expected to be normalized and non-zero.
pub fn look_rotation(local_forward: &Vec3, target_direction: &Vec3, local_up: &Vec3) -> Quat {
    let local_right = local_up.cross(local_forward).normalize();
    let local = Mat3::from_columns(&[local_right, *local_up, *local_forward]);
    let world = basis_from(target_direction, &world_up());
    orthonormal_to_quat(world * local.transpose())
}

/// Shortest-arc angle between two rotations
///
/// Uses `atan2` so that nearly identical rotations still report a tiny
/// angle instead of the `acos` noise floor.
pub fn angle_between(a: &Quat, b: &Quat) -> f32 {
    let difference = a.inverse() * b;
    2.0 * difference.imag().norm().atan2(difference.w.abs())
}

/// Advance `current` towards `target` by at most `max_angle` radians along
/// the shortest arc.
///
/// Returns `true` without touching `current` when the remaining angle is
/// already below `tolerance`.
pub fn rotate_towards(current: &mut Quat, target: &Quat, max_angle: f32, tolerance: f32) -> bool {
    let angle = angle_between(current, target);
    if angle < tolerance {
        return true;
    }
    let t = (max_angle / angle).min(1.0);
    *current = if t >= 1.0 {
        *target
    } else {
        current.try_slerp(target, t, f32::EPSILON).unwrap_or(*target)
    };
    false
}
