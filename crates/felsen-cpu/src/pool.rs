//! Host-memory buffer pool
//!
//! One pool per instance, fully allocated at creation against the instance
//! sizing. Kernels address buffers by integer index; every accessor bounds-
//! checks and reports `OutOfRange` without mutating anything.
//!
//! Scaling-factor buffers are keyed by partials-buffer index: one per-pattern
//! log-scaler vector per partials buffer, so a caller can keep several
//! alternative scaling histories without copying partials.

use felsen_core::{EvalError, EvalResult, InstanceSizing, PartialsOp};

/// A peeling child as the kernel sees it: dense partials, or compact states
/// for an unambiguous tip.
#[derive(Debug, Clone, Copy)]
pub enum ChildView<'a> {
    Partials(&'a [f64]),
    States(&'a [u32]),
}

/// Everything one peeling operation touches, borrowed together.
pub struct PeelViews<'a> {
    pub destination: &'a mut [f64],
    /// Per-pattern log-scaler storage, present only when rescaling.
    pub scale: Option<&'a mut [f64]>,
    pub child1: ChildView<'a>,
    pub matrix1: &'a [f64],
    pub child2: ChildView<'a>,
    pub matrix2: &'a [f64],
}

/// An eigen-decomposition `(U, U⁻¹, λ)` of a substitution rate matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct EigenDecomposition {
    /// Eigenvectors, `state_count × state_count`, row-major.
    pub vectors: Vec<f64>,
    /// Inverse eigenvectors, row-major.
    pub inverse_vectors: Vec<f64>,
    /// Eigenvalues, length `state_count`.
    pub values: Vec<f64>,
    /// Whether the buffer has been populated by a setter.
    pub populated: bool,
}

/// All numerical state of one CPU instance.
#[derive(Debug)]
pub struct BufferPool {
    sizing: InstanceSizing,
    partials: Vec<Vec<f64>>,
    tip_states: Vec<Option<Vec<u32>>>,
    eigens: Vec<EigenDecomposition>,
    matrices: Vec<Vec<f64>>,
    scale_factors: Vec<Vec<f64>>,
    category_rates: Vec<f64>,
}

/// Allocate a zeroed f64 buffer, reporting allocation failure instead of
/// aborting, so a failed creation leaks no partial state.
fn alloc_f64(len: usize, what: &str) -> EvalResult<Vec<f64>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| EvalError::OutOfMemory(format!("{what} ({len} reals)")))?;
    buffer.resize(len, 0.0);
    Ok(buffer)
}

impl BufferPool {
    pub fn new(sizing: InstanceSizing) -> EvalResult<Self> {
        sizing.validate()?;

        let mut partials = Vec::new();
        partials
            .try_reserve_exact(sizing.partials_buffer_count)
            .map_err(|_| EvalError::OutOfMemory("partials table".to_string()))?;
        for _ in 0..sizing.partials_buffer_count {
            partials.push(alloc_f64(sizing.partials_len(), "partials buffer")?);
        }

        let mut scale_factors = Vec::new();
        scale_factors
            .try_reserve_exact(sizing.partials_buffer_count)
            .map_err(|_| EvalError::OutOfMemory("scaling table".to_string()))?;
        for _ in 0..sizing.partials_buffer_count {
            scale_factors.push(alloc_f64(sizing.pattern_count, "scaling buffer")?);
        }

        let mut matrices = Vec::new();
        matrices
            .try_reserve_exact(sizing.matrix_buffer_count)
            .map_err(|_| EvalError::OutOfMemory("matrix table".to_string()))?;
        for _ in 0..sizing.matrix_buffer_count {
            matrices.push(alloc_f64(sizing.matrix_len(), "transition matrix buffer")?);
        }

        let eigens = (0..sizing.eigen_buffer_count)
            .map(|_| {
                Ok(EigenDecomposition {
                    vectors: alloc_f64(sizing.eigen_len(), "eigenvectors")?,
                    inverse_vectors: alloc_f64(sizing.eigen_len(), "inverse eigenvectors")?,
                    values: alloc_f64(sizing.state_count, "eigenvalues")?,
                    populated: false,
                })
            })
            .collect::<EvalResult<Vec<_>>>()?;

        Ok(Self {
            sizing,
            partials,
            tip_states: vec![None; sizing.compact_buffer_count],
            eigens,
            matrices,
            scale_factors,
            // Identity scaling until the caller sets real rates.
            category_rates: vec![1.0; sizing.category_count],
        })
    }

    pub fn sizing(&self) -> &InstanceSizing {
        &self.sizing
    }

    // ------------------------------------------------------------------
    // Setters / getters (copy across the boundary)
    // ------------------------------------------------------------------

    pub fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> EvalResult<()> {
        self.check_partials_index(buffer)?;
        check_len("partials length", partials.len(), self.sizing.partials_len())?;
        self.partials[buffer].copy_from_slice(partials);
        Ok(())
    }

    pub fn get_partials(&self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.check_partials_index(buffer)?;
        check_len("partials length", out.len(), self.sizing.partials_len())?;
        out.copy_from_slice(&self.partials[buffer]);
        Ok(())
    }

    /// Set a tip's partials from a `state_count · pattern_count` observation
    /// matrix (pattern-major, state fastest), replicated across categories.
    pub fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> EvalResult<()> {
        if tip >= self.sizing.tip_count {
            return Err(EvalError::out_of_range(
                "tip index",
                tip,
                self.sizing.tip_count,
            ));
        }
        self.check_partials_index(tip)?;
        let per_category = self.sizing.state_count * self.sizing.pattern_count;
        check_len("tip partials length", partials.len(), per_category)?;
        for chunk in self.partials[tip].chunks_exact_mut(per_category) {
            chunk.copy_from_slice(partials);
        }
        Ok(())
    }

    pub fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> EvalResult<()> {
        if tip >= self.sizing.tip_count {
            return Err(EvalError::out_of_range(
                "tip index",
                tip,
                self.sizing.tip_count,
            ));
        }
        if tip >= self.tip_states.len() {
            return Err(EvalError::out_of_range(
                "compact buffer index",
                tip,
                self.tip_states.len(),
            ));
        }
        check_len("tip states length", states.len(), self.sizing.pattern_count)?;
        // state_count itself is the missing/ambiguous sentinel.
        let sentinel = self.sizing.state_count as u32;
        if let Some(bad) = states.iter().position(|&s| s > sentinel) {
            return Err(EvalError::out_of_range(
                "tip state",
                states[bad] as usize,
                sentinel as usize + 1,
            ));
        }
        self.tip_states[tip] = Some(states.to_vec());
        Ok(())
    }

    pub fn set_eigen_decomposition(
        &mut self,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()> {
        if buffer >= self.eigens.len() {
            return Err(EvalError::out_of_range(
                "eigen buffer",
                buffer,
                self.eigens.len(),
            ));
        }
        check_len("eigenvector length", vectors.len(), self.sizing.eigen_len())?;
        check_len(
            "inverse eigenvector length",
            inverse_vectors.len(),
            self.sizing.eigen_len(),
        )?;
        check_len("eigenvalue length", values.len(), self.sizing.state_count)?;
        let eigen = &mut self.eigens[buffer];
        eigen.vectors.copy_from_slice(vectors);
        eigen.inverse_vectors.copy_from_slice(inverse_vectors);
        eigen.values.copy_from_slice(values);
        eigen.populated = true;
        Ok(())
    }

    pub fn set_category_rates(&mut self, rates: &[f64]) -> EvalResult<()> {
        check_len("category rates length", rates.len(), self.sizing.category_count)?;
        self.category_rates.copy_from_slice(rates);
        Ok(())
    }

    pub fn set_transition_matrix(&mut self, buffer: usize, matrix: &[f64]) -> EvalResult<()> {
        self.check_matrix_index(buffer)?;
        check_len("matrix length", matrix.len(), self.sizing.matrix_len())?;
        self.matrices[buffer].copy_from_slice(matrix);
        Ok(())
    }

    pub fn get_transition_matrix(&self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.check_matrix_index(buffer)?;
        check_len("matrix length", out.len(), self.sizing.matrix_len())?;
        out.copy_from_slice(&self.matrices[buffer]);
        Ok(())
    }

    pub fn reset_scale_factors(&mut self, scaling: usize) -> EvalResult<()> {
        self.check_partials_index(scaling)?;
        self.scale_factors[scaling].fill(0.0);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kernel-side access
    // ------------------------------------------------------------------

    pub fn category_rates(&self) -> &[f64] {
        &self.category_rates
    }

    pub fn eigen(&self, buffer: usize) -> EvalResult<&EigenDecomposition> {
        self.eigens
            .get(buffer)
            .ok_or_else(|| EvalError::out_of_range("eigen buffer", buffer, self.eigens.len()))
    }

    pub fn matrix(&self, buffer: usize) -> EvalResult<&[f64]> {
        self.check_matrix_index(buffer)?;
        Ok(&self.matrices[buffer])
    }

    pub fn matrix_mut(&mut self, buffer: usize) -> EvalResult<&mut [f64]> {
        self.check_matrix_index(buffer)?;
        Ok(&mut self.matrices[buffer])
    }

    pub fn partials(&self, buffer: usize) -> EvalResult<&[f64]> {
        self.check_partials_index(buffer)?;
        Ok(&self.partials[buffer])
    }

    /// Compact states for a tip-range buffer, when that tip was populated
    /// through `set_tip_states`. Kernels dispatch on this.
    pub fn tip_states(&self, buffer: usize) -> Option<&[u32]> {
        if buffer < self.sizing.tip_count {
            self.tip_states.get(buffer)?.as_deref()
        } else {
            None
        }
    }

    pub fn scale_factors(&self, scaling: usize) -> EvalResult<&[f64]> {
        self.check_partials_index(scaling)?;
        Ok(&self.scale_factors[scaling])
    }

    /// Eigen-decomposition and a destination matrix borrowed together, as the
    /// transition kernel needs them.
    pub fn eigen_and_matrix_mut(
        &mut self,
        eigen: usize,
        matrix: usize,
    ) -> EvalResult<(&EigenDecomposition, &[f64], &mut [f64])> {
        if eigen >= self.eigens.len() {
            return Err(EvalError::out_of_range(
                "eigen buffer",
                eigen,
                self.eigens.len(),
            ));
        }
        self.check_matrix_index(matrix)?;
        Ok((
            &self.eigens[eigen],
            &self.category_rates,
            &mut self.matrices[matrix],
        ))
    }

    /// Borrow everything one peeling operation touches: the destination
    /// partials mutably, both children (compact or dense), both edge
    /// matrices, and the scaling buffer when rescaling.
    ///
    /// The destination must be distinct from any child read as partials;
    /// aliasing would make the recursion read its own output.
    pub fn peel_views(&mut self, op: &PartialsOp, rescale: bool) -> EvalResult<PeelViews<'_>> {
        self.check_partials_index(op.destination)?;
        self.check_matrix_index(op.child1_matrix)?;
        self.check_matrix_index(op.child2_matrix)?;

        let compact1 = self.tip_states(op.child1).is_some();
        let compact2 = self.tip_states(op.child2).is_some();
        if !compact1 {
            self.check_partials_index(op.child1)?;
        }
        if !compact2 {
            self.check_partials_index(op.child2)?;
        }
        if (!compact1 && op.destination == op.child1)
            || (!compact2 && op.destination == op.child2)
        {
            return Err(EvalError::General(format!(
                "peeling destination {} aliases one of its children",
                op.destination
            )));
        }

        let scale = if rescale {
            let scaling = op.destination_scaling.ok_or(EvalError::OutOfRange {
                what: "scaling buffer",
                index: 0,
                limit: self.scale_factors.len(),
            })?;
            if scaling <= self.sizing.tip_count || scaling >= self.scale_factors.len() {
                return Err(EvalError::out_of_range(
                    "scaling buffer",
                    scaling,
                    self.scale_factors.len(),
                ));
            }
            Some(scaling)
        } else {
            None
        };

        // Distinctness was checked above, so the mutable destination view
        // cannot overlap the shared child views.
        let dest_ptr = self.partials[op.destination].as_mut_ptr();
        let dest_len = self.partials[op.destination].len();
        let destination = unsafe { std::slice::from_raw_parts_mut(dest_ptr, dest_len) };

        let partials = &self.partials;
        let tip_states = &self.tip_states;
        let matrices = &self.matrices;
        let child_view = |child: usize, compact: bool| {
            if compact {
                // Presence was verified by the dispatch probe above.
                ChildView::States(tip_states[child].as_deref().unwrap_or(&[]))
            } else {
                ChildView::Partials(partials[child].as_slice())
            }
        };

        Ok(PeelViews {
            destination,
            scale: match scale {
                Some(scaling) => Some(&mut self.scale_factors[scaling]),
                None => None,
            },
            child1: child_view(op.child1, compact1),
            matrix1: &matrices[op.child1_matrix],
            child2: child_view(op.child2, compact2),
            matrix2: &matrices[op.child2_matrix],
        })
    }

    fn check_partials_index(&self, buffer: usize) -> EvalResult<()> {
        if buffer >= self.partials.len() {
            return Err(EvalError::out_of_range(
                "partials buffer",
                buffer,
                self.partials.len(),
            ));
        }
        Ok(())
    }

    fn check_matrix_index(&self, buffer: usize) -> EvalResult<()> {
        if buffer >= self.matrices.len() {
            return Err(EvalError::out_of_range(
                "transition matrix buffer",
                buffer,
                self.matrices.len(),
            ));
        }
        Ok(())
    }
}

fn check_len(what: &'static str, got: usize, want: usize) -> EvalResult<()> {
    if got != want {
        return Err(EvalError::out_of_range(what, got, want));
    }
    Ok(())
}
