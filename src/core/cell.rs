use nalgebra::{Matrix3, Point3, Vector3};
use serde::{Deserialize, Serialize};

pub const ANGSTROM_TO_BOHR: f64 = 1.889725989;

/// A triclinic unit cell described by its six lattice parameters.
///
/// Lengths are in Angstrom, angles in degrees. The cell matrix is derived
/// on demand with the standard crystallographic convention: `a` along x,
/// `b` in the xy plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitCell {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl UnitCell {
    pub fn new(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Self {
        Self { a, b, c, alpha, beta, gamma }
    }

    pub fn params(&self) -> (f64, f64, f64, f64, f64, f64) {
        (self.a, self.b, self.c, self.alpha, self.beta, self.gamma)
    }

    /// Cell matrix with the lattice vectors as columns.
    pub fn matrix(&self) -> Matrix3<f64> {
        let (ca, cb, cg) = (
            self.alpha.to_radians().cos(),
            self.beta.to_radians().cos(),
            self.gamma.to_radians().cos(),
        );
        let sg = self.gamma.to_radians().sin();
        let v = (1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg)
            .max(0.0)
            .sqrt();

        let va = Vector3::new(self.a, 0.0, 0.0);
        let vb = Vector3::new(self.b * cg, self.b * sg, 0.0);
        let vc = Vector3::new(
            self.c * cb,
            self.c * (ca - cb * cg) / sg,
            self.c * v / sg,
        );
        Matrix3::from_columns(&[va, vb, vc])
    }

    /// Rebuilds lattice parameters from three cell vectors.
    pub fn from_vectors(va: Vector3<f64>, vb: Vector3<f64>, vc: Vector3<f64>) -> Self {
        let (a, b, c) = (va.norm(), vb.norm(), vc.norm());
        let angle = |u: &Vector3<f64>, v: &Vector3<f64>, lu: f64, lv: f64| {
            (u.dot(v) / (lu * lv)).clamp(-1.0, 1.0).acos().to_degrees()
        };
        Self {
            a,
            b,
            c,
            alpha: angle(&vb, &vc, b, c),
            beta: angle(&va, &vc, a, c),
            gamma: angle(&va, &vb, a, b),
        }
    }

    pub fn vector(&self, i: usize) -> Vector3<f64> {
        self.matrix().column(i).into()
    }

    pub fn volume(&self) -> f64 {
        self.matrix().determinant().abs()
    }

    pub fn to_fractional(&self, p: &Point3<f64>) -> Point3<f64> {
        match self.matrix().try_inverse() {
            Some(inv) => Point3::from(inv * p.coords),
            None => *p,
        }
    }

    pub fn to_cartesian(&self, f: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.matrix() * f.coords)
    }

    /// True when any parameter is NaN, infinite, or vanishingly small.
    pub fn is_degenerate(&self) -> bool {
        [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
            .iter()
            .any(|p| !p.is_finite() || p.abs() < 1e-8)
    }

    /// Returns a cell with the same shape scaled to the target volume.
    pub fn scaled_to_volume(&self, target: f64) -> Self {
        let current = self.volume();
        if current < 1e-12 || target <= 0.0 {
            return *self;
        }
        let s = (target / current).cbrt();
        Self {
            a: self.a * s,
            b: self.b * s,
            c: self.c * s,
            ..*self
        }
    }

    /// Minimum-image distance between two cartesian points.
    pub fn min_image_distance(&self, p1: &Point3<f64>, p2: &Point3<f64>) -> f64 {
        let m = self.matrix();
        let d_cart = p2 - p1;
        match m.try_inverse() {
            Some(inv) => {
                let mut d_frac = inv * d_cart;
                d_frac.x -= d_frac.x.round();
                d_frac.y -= d_frac.y.round();
                d_frac.z -= d_frac.z.round();
                (m * d_frac).norm()
            }
            None => d_cart.norm(),
        }
    }
}

/// Reduces the cell basis until every inter-axial angle lies in [60, 120]
/// degrees, by repeated Gauss pair reduction (each vector shortened against
/// the others by integer multiples). The lattice itself is unchanged; only
/// the basis choice moves.
///
/// Returns the reduced cell together with the raw reduced vectors expressed
/// in the original cartesian frame. Callers convert atom positions to
/// fractional coordinates against the raw vectors, wrap, and rebuild
/// cartesians from the new cell so the physical structure is preserved.
pub fn reduce_basis(cell: &UnitCell) -> (UnitCell, Matrix3<f64>) {
    let m = cell.matrix();
    let mut v = [
        Vector3::from(m.column(0)),
        Vector3::from(m.column(1)),
        Vector3::from(m.column(2)),
    ];

    for _ in 0..100 {
        let mut changed = false;
        for i in 0..3 {
            for j in 0..3 {
                if i == j {
                    continue;
                }
                let denom = v[j].dot(&v[j]);
                if denom < 1e-12 {
                    continue;
                }
                let t = (v[i].dot(&v[j]) / denom).round();
                if t != 0.0 {
                    v[i] -= v[j] * t;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    let raw = Matrix3::from_columns(&[v[0], v[1], v[2]]);
    (UnitCell::from_vectors(v[0], v[1], v[2]), raw)
}
