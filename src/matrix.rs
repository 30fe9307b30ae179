//! Dense row-major matrices backing the interpreter's numeric values.
//!
//! This is the interpreter's own value representation, not a general
//! linear-algebra library: exactly the operations the language exposes.

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols);
        Matrix { rows, cols, data }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Matrix::new(n, n);
        for i in 0..n {
            *m.at_mut(i, i) = 1.0;
        }
        m
    }

    pub fn ones(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![1.0; rows * cols],
        }
    }

    pub fn unit_vector(len: usize, index: usize, column: bool) -> Self {
        let mut m = if column {
            Matrix::new(len, 1)
        } else {
            Matrix::new(1, len)
        };
        m.data[index] = 1.0;
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_vector(&self) -> bool {
        self.rows == 1 || self.cols == 1
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn at_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.data[row * self.cols + col]
    }

    /// Linear element access in row-major order.
    pub fn linear(&self, index: usize) -> f64 {
        self.data[index]
    }

    pub fn linear_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.data[index]
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    pub fn same_shape(&self, other: &Matrix) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    pub fn add(&self, other: &Matrix) -> Option<Matrix> {
        if !self.same_shape(other) {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Some(Matrix::from_vec(self.rows, self.cols, data))
    }

    pub fn sub(&self, other: &Matrix) -> Option<Matrix> {
        if !self.same_shape(other) {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a - b)
            .collect();
        Some(Matrix::from_vec(self.rows, self.cols, data))
    }

    pub fn neg(&self) -> Matrix {
        self.map(|x| -x)
    }

    pub fn scale(&self, s: f64) -> Matrix {
        self.map(|x| x * s)
    }

    pub fn entrywise(&self, other: &Matrix) -> Option<Matrix> {
        if !self.same_shape(other) {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .collect();
        Some(Matrix::from_vec(self.rows, self.cols, data))
    }

    pub fn matmul(&self, other: &Matrix) -> Option<Matrix> {
        if self.cols != other.rows {
            return None;
        }
        let mut out = Matrix::new(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.at(i, k);
                if a == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    *out.at_mut(i, j) += a * other.at(k, j);
                }
            }
        }
        Some(out)
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::new(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                *out.at_mut(j, i) = self.at(i, j);
            }
        }
        out
    }

    /// Moore-Penrose pseudo-inverse via the normal equations; adequate for
    /// the full-rank cases the language promises.
    pub fn pseudo_inverse(&self) -> Option<Matrix> {
        let t = self.transpose();
        if self.rows >= self.cols {
            let gram = t.matmul(self)?;
            Some(gram.inverse()?.matmul(&t)?)
        } else {
            let gram = self.matmul(&t)?;
            Some(t.matmul(&gram.inverse()?)?)
        }
    }

    /// Gauss-Jordan with partial pivoting. None for non-square or singular.
    pub fn inverse(&self) -> Option<Matrix> {
        if !self.is_square() {
            return None;
        }
        let n = self.rows;
        let mut a = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let mut pivot = col;
            for row in col + 1..n {
                if a.at(row, col).abs() > a.at(pivot, col).abs() {
                    pivot = row;
                }
            }
            if a.at(pivot, col).abs() < 1e-300 {
                return None;
            }
            if pivot != col {
                a.swap_rows(pivot, col);
                inv.swap_rows(pivot, col);
            }

            let diag = a.at(col, col);
            for j in 0..n {
                *a.at_mut(col, j) /= diag;
                *inv.at_mut(col, j) /= diag;
            }
            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = a.at(row, col);
                if factor == 0.0 {
                    continue;
                }
                for j in 0..n {
                    let v = a.at(col, j);
                    *a.at_mut(row, j) -= factor * v;
                    let v = inv.at(col, j);
                    *inv.at_mut(row, j) -= factor * v;
                }
            }
        }
        Some(inv)
    }

    /// Solve `self · x = rhs`.
    pub fn solve(&self, rhs: &Matrix) -> Option<Matrix> {
        if self.rows != rhs.rows {
            return None;
        }
        Some(self.inverse()?.matmul(rhs)?)
    }

    pub fn determinant(&self) -> Option<f64> {
        if !self.is_square() {
            return None;
        }
        let n = self.rows;
        let mut a = self.clone();
        let mut det = 1.0;
        for col in 0..n {
            let mut pivot = col;
            for row in col + 1..n {
                if a.at(row, col).abs() > a.at(pivot, col).abs() {
                    pivot = row;
                }
            }
            if a.at(pivot, col) == 0.0 {
                return Some(0.0);
            }
            if pivot != col {
                a.swap_rows(pivot, col);
                det = -det;
            }
            det *= a.at(col, col);
            for row in col + 1..n {
                let factor = a.at(row, col) / a.at(col, col);
                for j in col..n {
                    let v = a.at(col, j);
                    *a.at_mut(row, j) -= factor * v;
                }
            }
        }
        Some(det)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        for j in 0..self.cols {
            let tmp = self.at(a, j);
            *self.at_mut(a, j) = self.at(b, j);
            *self.at_mut(b, j) = tmp;
        }
    }

    pub fn dot(&self, other: &Matrix) -> Option<f64> {
        if !self.is_vector() || !other.is_vector() || self.size() != other.size() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a * b)
                .sum(),
        )
    }

    pub fn cross(&self, other: &Matrix) -> Option<Matrix> {
        if self.size() != 3 || other.size() != 3 {
            return None;
        }
        let (a, b) = (&self.data, &other.data);
        Some(Matrix::from_vec(
            3,
            1,
            vec![
                a[1] * b[2] - a[2] * b[1],
                a[2] * b[0] - a[0] * b[2],
                a[0] * b[1] - a[1] * b[0],
            ],
        ))
    }

    pub fn outer(&self, other: &Matrix) -> Option<Matrix> {
        if !self.is_vector() || !other.is_vector() {
            return None;
        }
        let mut out = Matrix::new(self.size(), other.size());
        for i in 0..self.size() {
            for j in 0..other.size() {
                *out.at_mut(i, j) = self.data[i] * other.data[j];
            }
        }
        Some(out)
    }

    pub fn norm_l2(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    pub fn norm_squared(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }

    pub fn norm_l1(&self) -> f64 {
        self.data.iter().map(|x| x.abs()).sum()
    }

    pub fn norm_linf(&self) -> f64 {
        self.data.iter().fold(0.0, |m, x| m.max(x.abs()))
    }

    pub fn norm_p(&self, p: f64) -> f64 {
        let sum: f64 = self.data.iter().map(|x| x.abs().powf(p)).sum();
        sum.powf(1.0 / p)
    }

    /// Hat operator: ℝ³ → so(3), or an SE(3) twist (6-vector) → 4×4.
    pub fn hat(&self) -> Option<Matrix> {
        if self.size() == 3 && self.is_vector() {
            let a = &self.data;
            Some(Matrix::from_vec(
                3,
                3,
                vec![
                    0.0, -a[2], a[1], //
                    a[2], 0.0, -a[0], //
                    -a[1], a[0], 0.0,
                ],
            ))
        } else if self.size() == 6 && self.is_vector() {
            let a = &self.data;
            Some(Matrix::from_vec(
                4,
                4,
                vec![
                    0.0, -a[2], a[1], a[3], //
                    a[2], 0.0, -a[0], a[4], //
                    -a[1], a[0], 0.0, a[5], //
                    0.0, 0.0, 0.0, 1.0,
                ],
            ))
        } else {
            None
        }
    }

    /// Vee operator: inverse of `hat` on 3×3 and 4×4 layouts.
    pub fn vee(&self) -> Option<Matrix> {
        if self.rows == 3 && self.cols == 3 {
            Some(Matrix::from_vec(
                3,
                1,
                vec![self.at(2, 1), self.at(0, 2), self.at(1, 0)],
            ))
        } else if self.rows == 4 && self.cols == 4 {
            Some(Matrix::from_vec(
                6,
                1,
                vec![
                    self.at(2, 1),
                    self.at(0, 2),
                    self.at(1, 0),
                    self.at(0, 3),
                    self.at(1, 3),
                    self.at(2, 3),
                ],
            ))
        } else {
            None
        }
    }

    pub fn pow(&self, n: u32) -> Option<Matrix> {
        if !self.is_square() {
            return None;
        }
        let mut out = Matrix::identity(self.rows);
        for _ in 0..n {
            out = out.matmul(self)?;
        }
        Some(out)
    }

    pub fn approx_eq(&self, other: &Matrix, tol: f64) -> bool {
        self.same_shape(other)
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() < tol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat2(a: f64, b: f64, c: f64, d: f64) -> Matrix {
        Matrix::from_vec(2, 2, vec![a, b, c, d])
    }

    #[test]
    fn matmul_computes_products() {
        let a = mat2(1.0, 2.0, 3.0, 4.0);
        let b = mat2(5.0, 6.0, 7.0, 8.0);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.data(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn matmul_rejects_mismatched_inner_dims() {
        let a = Matrix::new(2, 3);
        let b = Matrix::new(2, 3);
        assert!(a.matmul(&b).is_none());
    }

    #[test]
    fn inverse_times_original_is_identity() {
        let a = mat2(4.0, 7.0, 2.0, 6.0);
        let inv = a.inverse().unwrap();
        let product = a.matmul(&inv).unwrap();
        assert!(product.approx_eq(&Matrix::identity(2), 1e-10));
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let a = mat2(1.0, 2.0, 2.0, 4.0);
        assert!(a.inverse().is_none());
    }

    #[test]
    fn solve_matches_inverse_multiply() {
        let a = mat2(2.0, 0.0, 0.0, 4.0);
        let b = Matrix::from_vec(2, 1, vec![2.0, 8.0]);
        let x = a.solve(&b).unwrap();
        assert!(x.approx_eq(&Matrix::from_vec(2, 1, vec![1.0, 2.0]), 1e-12));
    }

    #[test]
    fn determinant_of_known_matrix() {
        let a = mat2(3.0, 8.0, 4.0, 6.0);
        assert!((a.determinant().unwrap() + 14.0).abs() < 1e-12);
    }

    #[test]
    fn transpose_swaps_entries() {
        let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = a.transpose();
        assert_eq!((t.rows(), t.cols()), (3, 2));
        assert_eq!(t.at(0, 1), 4.0);
        assert_eq!(t.at(2, 0), 3.0);
    }

    #[test]
    fn cross_product_of_basis_vectors() {
        let x = Matrix::from_vec(3, 1, vec![1.0, 0.0, 0.0]);
        let y = Matrix::from_vec(3, 1, vec![0.0, 1.0, 0.0]);
        let z = x.cross(&y).unwrap();
        assert_eq!(z.data(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn dot_product() {
        let a = Matrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]);
        let b = Matrix::from_vec(3, 1, vec![4.0, 5.0, 6.0]);
        assert_eq!(a.dot(&b), Some(32.0));
    }

    #[test]
    fn norms_of_three_four_vector() {
        let v = Matrix::from_vec(2, 1, vec![3.0, 4.0]);
        assert!((v.norm_l2() - 5.0).abs() < 1e-12);
        assert!((v.norm_l1() - 7.0).abs() < 1e-12);
        assert!((v.norm_linf() - 4.0).abs() < 1e-12);
        assert!((v.norm_squared() - 25.0).abs() < 1e-12);
        assert!((v.norm_p(2.0) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn hat_and_vee_are_inverse_on_r3() {
        let v = Matrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]);
        let hatted = v.hat().unwrap();
        assert_eq!(hatted.at(0, 1), -3.0);
        let back = hatted.vee().unwrap();
        assert!(back.approx_eq(&v, 1e-12));
    }

    #[test]
    fn se3_hat_embeds_twist() {
        let twist = Matrix::from_vec(6, 1, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let m = twist.hat().unwrap();
        assert_eq!((m.rows(), m.cols()), (4, 4));
        assert_eq!(m.at(0, 3), 4.0);
        assert_eq!(m.at(3, 3), 1.0);
        assert!(m.vee().unwrap().approx_eq(&twist, 1e-12));
    }

    #[test]
    fn unit_vector_has_single_one() {
        let e = Matrix::unit_vector(4, 2, true);
        assert_eq!(e.data(), &[0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn pow_repeats_multiplication() {
        let a = mat2(2.0, 0.0, 0.0, 3.0);
        let cubed = a.pow(3).unwrap();
        assert_eq!(cubed.at(0, 0), 8.0);
        assert_eq!(cubed.at(1, 1), 27.0);
    }
}
