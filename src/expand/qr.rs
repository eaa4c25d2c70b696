//! Batched, blocked Householder QR as a shape-static graph expansion
//!
//! Emits a subgraph computing `(Q, R)` for an operand of shape `[*B, m, n]`
//! using only the primitive op set: unblocked panel factorization
//! (Golub & Van Loan alg. 5.2.1), compact-WY aggregation of the panel's
//! reflectors (Schreiber & Van Loan), and a blocked driver (alg. 5.2.2) that
//! spends the bulk of its work in batched matmul.
//!
//! Every tensor in the expansion has a shape fixed at construction time.
//! Where the textbook algorithms shrink a sub-panel per iteration, this
//! formulation computes full-width and masks with column-index comparisons;
//! the extra flops buy shape invariance, which the loop primitive and the
//! backends require. Do not "optimize" the masks into data-dependent shapes.

use crate::error::{Error, Result};
use crate::graph::{Graph, Precision, TensorRef};
use crate::tensor::Shape;

/// Block size used by [`crate::expand::QrExpander`] when none is chosen.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Result of factoring one panel in place
pub struct PanelQr {
    /// The panel with `R` in its upper triangle and the essential
    /// Householder vectors below the diagonal
    pub panel: TensorRef,
    /// Reflector coefficients, one per factored column
    pub taus: TensorRef,
}

/// Householder reflector `H = I - tau v v^T` zeroing `x` below pivot row `k`.
///
/// `H x` keeps positions `[0, k)` of `x`, puts `beta` at `k`, and zero below.
/// `k` is an I32 scalar handle so the caller's loop can supply it; the tail
/// `x[k+1..]` is materialized full-width under an `iota > k` mask to keep the
/// shape independent of `k`. `v[k] = 1` and `v[0..k] = 0`.
///
/// A column that is already zero below the pivot yields `tau = 0` (so
/// `H = I`) with `v = e_k` and a unit divisor; nothing degenerates to NaN.
/// Columns whose norm overflows the working precision are out of contract.
fn house(
    g: &mut Graph,
    x: TensorRef,
    k: TensorRef,
    batch_dims: &[usize],
    m: usize,
) -> Result<(TensorRef, TensorRef, TensorRef)> {
    let dtype = g.dtype_of(x)?;
    let x_shape = g.shape_of(x)?.clone();
    let nb = batch_dims.len();
    let batch_ids: Vec<usize> = (0..nb).collect();

    // alpha = x[k]
    let x_at_k = g.dynamic_slice_in_minor_dims(x, &[k], &[1])?;
    let alpha = g.reshape(x_at_k, Shape::from(batch_dims))?;

    // x_after_k = x with positions [0, k] zeroed
    let iota_m = g.iota([m], 0)?;
    let k_m = g.broadcast_in_dim(k, [m], &[])?;
    let after_k = g.gt(iota_m, k_m)?;
    let after_k_f = g.cast(after_k, dtype)?;
    let after_k_full = g.broadcast_in_dim(after_k_f, x_shape.clone(), &[nb])?;
    let x_after_k = g.mul(x, after_k_full)?;

    // sigma = sum(x_after_k^2), mu = sqrt(alpha^2 + sigma)
    let sq = g.mul(x_after_k, x_after_k)?;
    let sigma = g.reduce_sum(sq, nb)?;
    let alpha_sq = g.mul(alpha, alpha)?;
    let sum = g.add(alpha_sq, sigma)?;
    let mu = g.sqrt(sum)?;

    let zero = g.scalar_like(alpha, 0.0)?;
    let one = g.scalar_like(alpha, 1.0)?;
    let neg_one = g.scalar_like(alpha, -1.0)?;
    let sigma_is_zero = g.eq(sigma, zero)?;

    // beta = -sign(alpha) * mu, with sign(0) := +1
    let alpha_neg = g.lt(alpha, zero)?;
    let sign_factor = g.select(alpha_neg, one, neg_one)?;
    let signed_mu = g.mul(sign_factor, mu)?;
    let beta = g.select(sigma_is_zero, alpha, signed_mu)?;

    let beta_minus_alpha = g.sub(beta, alpha)?;
    let tau_expr = g.div(beta_minus_alpha, beta)?;
    let tau = g.select(sigma_is_zero, zero, tau_expr)?;

    // When sigma is zero, x_after_k is zero, so any non-zero divisor works.
    let alpha_minus_beta = g.sub(alpha, beta)?;
    let divisor = g.select(sigma_is_zero, one, alpha_minus_beta)?;

    // v = e_k + x_after_k / divisor
    let at_k = g.eq(iota_m, k_m)?;
    let at_k_f = g.cast(at_k, dtype)?;
    let e_k = g.broadcast_in_dim(at_k_f, x_shape.clone(), &[nb])?;
    let divisor_full = g.broadcast_in_dim(divisor, x_shape, &batch_ids)?;
    let tail = g.div(x_after_k, divisor_full)?;
    let v = g.add(e_k, tail)?;

    Ok((v, tau, beta))
}

/// Factor a panel in place with unblocked Householder QR.
///
/// Returns the panel holding `R` in its upper triangle and the essential
/// reflector vectors in its strict lower triangle, plus the `tau`s. Used as
/// the inner kernel of [`build_qr`], so it accumulates `(v, tau)` pairs
/// rather than forming `Q`.
///
/// The column loop is a static-trip loop over `(panel, taus)` state. The
/// trailing update is computed full-width against a copy of the panel whose
/// columns `<= j` are zeroed, so columns already factored see a zero update.
/// Column `j` itself is rewritten from `(x[..j], beta, v[j+1..])` rather
/// than read back from the update; those values are exact in `house`'s
/// arithmetic and the rewrite keeps accumulated rounding out of the
/// diagonal and the stored reflectors.
pub fn qr_panel(g: &mut Graph, a: TensorRef, precision: Precision) -> Result<PanelQr> {
    let a_shape = g.shape_of(a)?.clone();
    let rank = a_shape.ndim();
    if rank < 2 {
        return Err(Error::invalid_argument(
            "a",
            format!("rank >= 2 required; got shape {a_shape:?}"),
        ));
    }
    let dtype = g.dtype_of(a)?;
    let nb = rank - 2;
    let batch_dims: Vec<usize> = a_shape[..nb].to_vec();
    let batch_ids: Vec<usize> = (0..nb).collect();
    let m = a_shape[rank - 2];
    let n = a_shape[rank - 1];
    let p = m.min(n);

    let taus_init = g.splat(dtype, 0.0, Shape::concat(&batch_dims, &[p]))?;

    let results = g.for_each_index(p, &[a, taus_init], |g, j, state| {
        let (a, taus) = (state[0], state[1]);
        let mn_shape = Shape::concat(&batch_dims, &[m, n]);
        let col_shape = Shape::concat(&batch_dims, &[m]);

        // v, tau, beta = house(a[.., :, j], j)
        let x_col = g.dynamic_slice_in_minor_dims(a, &[j], &[1])?;
        let x = g.reshape(x_col, col_shape.clone())?;
        let (v, tau, beta) = house(g, x, j, &batch_dims, m)?;

        // a[.., :, j+1:] -= tau * (v (v^T a[.., :, j+1:]))
        // Columns <= j are zeroed before the products, so the full-width
        // update leaves them untouched.
        let col_index = g.iota(mn_shape.clone(), nb + 1)?;
        let j_mn = g.broadcast_in_dim(j, mn_shape.clone(), &[])?;
        let past_j = g.lt(j_mn, col_index)?;
        let a_zeros = g.zeros_like(a)?;
        let a_masked = g.select(past_j, a, a_zeros)?;
        let v_row = g.reshape(v, Shape::concat(&batch_dims, &[1, m]))?;
        let w = g.matmul(v_row, false, a_masked, false, precision)?;
        let vva = g.matmul(v_row, true, w, false, precision)?;
        let tau_mn = g.broadcast_in_dim(tau, mn_shape.clone(), &batch_ids)?;
        let update = g.mul(tau_mn, vva)?;
        let a = g.sub(a, update)?;

        // Rewrite column j from its exact parts:
        //   a[.., :j, j] = x[.., :j];  a[.., j, j] = beta;  a[.., j+1:, j] = v[.., j+1:]
        let iota_col = g.iota([m], 0)?;
        let row_index = g.broadcast_in_dim(iota_col, col_shape.clone(), &[nb])?;
        let j_col = g.broadcast_in_dim(j, col_shape.clone(), &[])?;
        let before = g.lt(row_index, j_col)?;
        let at = g.eq(row_index, j_col)?;
        let after = g.gt(row_index, j_col)?;
        let before_f = g.cast(before, dtype)?;
        let at_f = g.cast(at, dtype)?;
        let after_f = g.cast(after, dtype)?;
        let beta_col = g.broadcast_in_dim(beta, col_shape.clone(), &batch_ids)?;
        let kept = g.mul(x, before_f)?;
        let pivot = g.mul(beta_col, at_f)?;
        let tail = g.mul(v, after_f)?;
        let partial = g.add(kept, pivot)?;
        let new_col = g.add(partial, tail)?;
        let mut col_to_panel = batch_ids.clone();
        col_to_panel.push(nb);
        let new_col_mn = g.broadcast_in_dim(new_col, mn_shape, &col_to_panel)?;
        let is_col_j = g.eq(col_index, j_mn)?;
        let a = g.select(is_col_j, new_col_mn, a)?;

        // taus[.., j] = tau
        let taus_shape = g.shape_of(taus)?.clone();
        let tau_index = g.iota(taus_shape.clone(), nb)?;
        let j_taus = g.broadcast_in_dim(j, taus_shape.clone(), &[])?;
        let tau_full = g.broadcast_in_dim(tau, taus_shape, &batch_ids)?;
        let taus_zeros = g.zeros_like(taus)?;
        let is_j = g.eq(tau_index, j_taus)?;
        let tau_update = g.select(is_j, tau_full, taus_zeros)?;
        let taus = g.add(taus, tau_update)?;

        Ok(vec![a, taus])
    })?;

    Ok(PanelQr {
        panel: results[0],
        taus: results[1],
    })
}

/// Upper-triangular `T` such that `I - V T V^T` is the product of the
/// elementary reflectors held columnwise in `V` with coefficients `taus`.
///
/// Schreiber & Van Loan's compact-WY construction, with `V^T V` computed as
/// one matmul up front instead of many matrix-vector products. The `-tau`
/// columnwise scale folds the update's sign into `T`, which is why the
/// blocked driver applies it with `+`.
pub fn compact_wy(
    g: &mut Graph,
    v: TensorRef,
    taus: TensorRef,
    precision: Precision,
) -> Result<TensorRef> {
    let v_shape = g.shape_of(v)?.clone();
    let dtype = g.dtype_of(v)?;
    let rank = v_shape.ndim();
    let nb = rank - 2;
    let batch_ids: Vec<usize> = (0..nb).collect();
    let k = v_shape[rank - 1];
    let kk_shape = Shape::concat(&v_shape[..nb], &[k, k]);

    let eye_small = g.identity_matrix(dtype, k, k)?;
    let eye = g.broadcast_in_dim(eye_small, kk_shape.clone(), &[nb, nb + 1])?;

    // vtv = -taus * (strict_upper(V^T V) + I), columnwise
    let vtv_full = g.matmul(v, true, v, false, precision)?;
    let on_or_below = g.triangle_mask(vtv_full, 0)?;
    let vtv_zeros = g.zeros_like(vtv_full)?;
    let strict_upper = g.select(on_or_below, vtv_zeros, vtv_full)?;
    let with_eye = g.add(strict_upper, eye)?;
    let neg_taus = g.neg(taus)?;
    let mut tau_to_cols = batch_ids.clone();
    tau_to_cols.push(nb + 1);
    let tau_cols = g.broadcast_in_dim(neg_taus, kk_shape, &tau_to_cols)?;
    let vtv = g.mul(with_eye, tau_cols)?;

    // t[.., :, j] = t @ vtv[.., :, j]; columns below j are already final, so
    // each product only reads finished columns. Iteration 0 lands diag(-tau).
    let results = g.for_each_index(k, &[eye, vtv], |g, j, state| {
        let (t, vtv) = (state[0], state[1]);
        let yv = g.dynamic_slice_in_minor_dims(vtv, &[j], &[1])?;
        let z = g.matmul(t, false, yv, false, precision)?;
        let t = g.dynamic_update_slice_in_minor_dims(t, z, &[j])?;
        Ok(vec![t, vtv])
    })?;

    Ok(results[0])
}

/// Emit the blocked QR decomposition of `a` into `g`.
///
/// Returns a tuple-valued handle `(Q, R)` with shapes `[*B, m, m]` and
/// `[*B, m, n]`. Walks the columns in blocks of `block_size`: each panel is
/// factored unblocked, its reflectors are aggregated into a compact-WY `T`,
/// and the trailing columns of `a` and the accumulated `Q` are updated with
/// two matmuls each. A `block_size >= min(m, n)` degrades to a single
/// blocked step.
///
/// # Errors
///
/// `InvalidArgument` if `a` has rank < 2 or `block_size < 1`;
/// `UnsupportedDType` if `a` is not f32 or f64.
pub fn build_qr(
    g: &mut Graph,
    a: TensorRef,
    block_size: usize,
    precision: Precision,
) -> Result<TensorRef> {
    let a_shape = g.shape_of(a)?.clone();
    let rank = a_shape.ndim();
    if rank < 2 {
        return Err(Error::invalid_argument(
            "a",
            format!("rank >= 2 required; got shape {a_shape:?}"),
        ));
    }
    if block_size < 1 {
        return Err(Error::invalid_argument(
            "block_size",
            format!("must be >= 1; got {block_size}"),
        ));
    }
    let dtype = g.dtype_of(a)?;
    if !dtype.is_float() {
        return Err(Error::unsupported_dtype(dtype, "qr"));
    }

    let nb = rank - 2;
    let batch_dims: Vec<usize> = a_shape[..nb].to_vec();
    let m = a_shape[rank - 2];
    let n = a_shape[rank - 1];
    let p = m.min(n);

    let eye_m = g.identity_matrix(dtype, m, m)?;
    let mut q = g.broadcast_in_dim(eye_m, Shape::concat(&batch_dims, &[m, m]), &[nb, nb + 1])?;

    let mut a = a;
    for i in (0..p).step_by(block_size) {
        let k = block_size.min(p - i);

        let a_block = g.slice_in_minor_dims(a, &[i, i], &[m, i + k])?;
        let PanelQr { panel, taus } = qr_panel(g, a_block, precision)?;

        // y = I + strict_lower(panel): unit diagonals over the essential
        // reflector vectors
        let lower = g.strict_lower_triangle(panel)?;
        let eye_small = g.identity_matrix(dtype, m - i, k)?;
        let eye = g.broadcast_in_dim(
            eye_small,
            Shape::concat(&batch_dims, &[m - i, k]),
            &[nb, nb + 1],
        )?;
        let y = g.add(eye, lower)?;

        a = g.update_slice_in_minor_dims(a, panel, &[i, i])?;

        let t = compact_wy(g, y, taus, precision)?;
        let yt = g.matmul(y, false, t, true, precision)?;

        // a[.., i:, i+k:] += (y t^T) (y^T a[.., i:, i+k:])
        // The sign lives in t, so the visible update is additive.
        let a_tail = g.slice_in_minor_dims(a, &[i, i + k], &[m, n])?;
        let inner = g.matmul(y, true, a_tail, false, precision)?;
        let outer = g.matmul(yt, false, inner, false, precision)?;
        let a_tail = g.add(a_tail, outer)?;
        a = g.update_slice_in_minor_dims(a, a_tail, &[i, i + k])?;

        // q[.., :, i:] += (q[.., :, i:] y) (y t^T)^T
        let q_panel = g.slice_in_minor_dims(q, &[0, i], &[m, m])?;
        let qy = g.matmul(q_panel, false, y, false, precision)?;
        let q_update = g.matmul(qy, false, yt, true, precision)?;
        let q_panel = g.add(q_panel, q_update)?;
        q = g.update_slice_in_minor_dims(q, q_panel, &[0, i])?;
    }

    let r = g.upper_triangle(a)?;
    Ok(g.tuple(&[q, r]))
}
