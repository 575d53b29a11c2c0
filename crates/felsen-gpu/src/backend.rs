//! `LikelihoodBackend` implementation for the Metal engine

use log::trace;
use metal::MTLResourceOptions;

use felsen_core::{
    validate_operations, Capabilities, EdgeSpec, EvalError, EvalResult, InstanceSizing,
    LikelihoodBackend, MatrixRequest, PartialsOp, RootSpec,
};
use felsen_cpu::transition::{category_matrix, Derivative};

use crate::MetalBackend;

/// Matches the `PeelParams` struct in the shader source.
#[repr(C)]
#[derive(Clone, Copy)]
struct PeelParams {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    rescale: u32,
}

/// Matches the `IntegrateParams` struct in the shader source.
#[repr(C)]
#[derive(Clone, Copy)]
struct IntegrateParams {
    state_count: u32,
    pattern_count: u32,
    category_count: u32,
    accumulate: u32,
    want_first: u32,
    want_second: u32,
}

impl MetalBackend {
    fn peel_params(&self, rescale: bool) -> PeelParams {
        PeelParams {
            state_count: self.sizing.state_count as u32,
            pattern_count: self.sizing.pattern_count as u32,
            category_count: self.sizing.category_count as u32,
            rescale: rescale as u32,
        }
    }

    /// Compact-state view is taken for tip-range children with states set,
    /// exactly as on the CPU engines.
    fn is_compact(&self, buffer: usize) -> bool {
        buffer < self.sizing.tip_count
            && self
                .tip_states
                .get(buffer)
                .map_or(false, Option::is_some)
    }

    /// Add host-side scale factors into a read-back log-likelihood vector.
    fn apply_scale_factors(&self, scale_buffers: &[usize], out: &mut [f64]) -> EvalResult<()> {
        let mut factors = vec![0.0; self.sizing.pattern_count];
        for &scaling in scale_buffers {
            self.check_index("scaling buffer", scaling, self.scale_factors.len())?;
            Self::read_f32(&self.scale_factors[scaling], &mut factors);
            for (entry, &factor) in out.iter_mut().zip(&factors) {
                *entry += factor;
            }
        }
        Ok(())
    }
}

impl LikelihoodBackend for MetalBackend {
    fn sizing(&self) -> &InstanceSizing {
        &self.sizing
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::PROCESSOR_GPU
            | Capabilities::PRECISION_SINGLE
            | Capabilities::COMPUTATION_ASYNCH
    }

    fn resource_index(&self) -> usize {
        2
    }

    fn initialize(&mut self) -> EvalResult<()> {
        self.compile_pipelines()
    }

    fn set_partials(&mut self, buffer: usize, partials: &[f64]) -> EvalResult<()> {
        self.check_index("partials buffer", buffer, self.partials.len())?;
        Self::check_len("partials length", partials.len(), self.sizing.partials_len())?;
        self.sync_all();
        Self::write_f32(&self.partials[buffer], partials);
        Ok(())
    }

    fn get_partials(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.check_index("partials buffer", buffer, self.partials.len())?;
        Self::check_len("partials length", out.len(), self.sizing.partials_len())?;
        self.sync_buffer(buffer);
        Self::read_f32(&self.partials[buffer], out);
        Ok(())
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> EvalResult<()> {
        self.check_index("tip index", tip, self.sizing.tip_count)?;
        self.check_index("partials buffer", tip, self.partials.len())?;
        let per_category = self.sizing.state_count * self.sizing.pattern_count;
        Self::check_len("tip partials length", partials.len(), per_category)?;
        self.sync_all();
        let mut replicated = vec![0.0; self.sizing.partials_len()];
        for chunk in replicated.chunks_exact_mut(per_category) {
            chunk.copy_from_slice(partials);
        }
        Self::write_f32(&self.partials[tip], &replicated);
        Ok(())
    }

    fn set_tip_states(&mut self, tip: usize, states: &[u32]) -> EvalResult<()> {
        self.check_index("tip index", tip, self.sizing.tip_count)?;
        self.check_index("compact buffer index", tip, self.tip_states.len())?;
        Self::check_len("tip states length", states.len(), self.sizing.pattern_count)?;
        let sentinel = self.sizing.state_count as u32;
        if let Some(bad) = states.iter().position(|&s| s > sentinel) {
            return Err(EvalError::out_of_range(
                "tip state",
                states[bad] as usize,
                sentinel as usize + 1,
            ));
        }
        self.sync_all();
        let buffer = self.device.new_buffer_with_data(
            states.as_ptr() as *const std::ffi::c_void,
            std::mem::size_of_val(states) as u64,
            MTLResourceOptions::StorageModeShared,
        );
        self.tip_states[tip] = Some(buffer);
        Ok(())
    }

    fn set_eigen_decomposition(
        &mut self,
        buffer: usize,
        vectors: &[f64],
        inverse_vectors: &[f64],
        values: &[f64],
    ) -> EvalResult<()> {
        self.check_index("eigen buffer", buffer, self.eigens.len())?;
        Self::check_len("eigenvector length", vectors.len(), self.sizing.eigen_len())?;
        Self::check_len(
            "inverse eigenvector length",
            inverse_vectors.len(),
            self.sizing.eigen_len(),
        )?;
        Self::check_len("eigenvalue length", values.len(), self.sizing.state_count)?;
        let eigen = &mut self.eigens[buffer];
        eigen.vectors.copy_from_slice(vectors);
        eigen.inverse_vectors.copy_from_slice(inverse_vectors);
        eigen.values.copy_from_slice(values);
        eigen.populated = true;
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> EvalResult<()> {
        Self::check_len("category rates length", rates.len(), self.sizing.category_count)?;
        self.category_rates.copy_from_slice(rates);
        Ok(())
    }

    fn set_transition_matrix(&mut self, buffer: usize, matrix: &[f64]) -> EvalResult<()> {
        self.check_index("transition matrix buffer", buffer, self.matrices.len())?;
        Self::check_len("matrix length", matrix.len(), self.sizing.matrix_len())?;
        self.sync_all();
        Self::write_f32(&self.matrices[buffer], matrix);
        Ok(())
    }

    fn get_transition_matrix(&mut self, buffer: usize, out: &mut [f64]) -> EvalResult<()> {
        self.check_index("transition matrix buffer", buffer, self.matrices.len())?;
        Self::check_len("matrix length", out.len(), self.sizing.matrix_len())?;
        Self::read_f32(&self.matrices[buffer], out);
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen: usize,
        requests: &[MatrixRequest],
    ) -> EvalResult<()> {
        self.check_index("eigen buffer", eigen, self.eigens.len())?;
        if !self.eigens[eigen].populated {
            return Err(EvalError::General(format!(
                "eigen buffer {eigen} was never set"
            )));
        }
        for request in requests {
            for target in [
                Some(request.matrix),
                request.first_derivative,
                request.second_derivative,
            ]
            .into_iter()
            .flatten()
            {
                self.check_index("transition matrix buffer", target, self.matrices.len())?;
            }
        }

        // Host writes into device-visible matrix memory; drain in-flight
        // readers first.
        self.sync_all();

        let states = self.sizing.state_count;
        let per_category = states * states;
        let mut host_matrix = vec![0.0; self.sizing.matrix_len()];
        for request in requests {
            let targets = [
                (Some(request.matrix), Derivative::None),
                (request.first_derivative, Derivative::First),
                (request.second_derivative, Derivative::Second),
            ];
            for (target, derivative) in targets {
                let Some(matrix_index) = target else {
                    continue;
                };
                for (category, &rate) in self.category_rates.iter().enumerate() {
                    let slot =
                        &mut host_matrix[category * per_category..(category + 1) * per_category];
                    category_matrix(
                        &self.eigens[eigen],
                        states,
                        request.edge_length,
                        rate,
                        derivative,
                        slot,
                    );
                }
                Self::write_f32(&self.matrices[matrix_index], &host_matrix);
            }
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[PartialsOp], rescale: bool) -> EvalResult<()> {
        validate_operations(&self.sizing, operations, rescale)?;
        if operations.is_empty() {
            return Ok(());
        }

        // Resolve and validate the whole batch before anything is encoded,
        // so a bad entry anywhere leaves no partial command buffer behind.
        // The peel is a product of the two child factors, so a compact child
        // can always be ordered first.
        let mut plan = Vec::with_capacity(operations.len());
        for op in operations {
            let (child1, matrix1, child2, matrix2) =
                if !self.is_compact(op.child1) && self.is_compact(op.child2) {
                    (op.child2, op.child2_matrix, op.child1, op.child1_matrix)
                } else {
                    (op.child1, op.child1_matrix, op.child2, op.child2_matrix)
                };
            let compact1 = self.is_compact(child1);
            let compact2 = self.is_compact(child2);
            let kernel = match (compact1, compact2) {
                (false, false) => "peel_partials_partials",
                (true, false) => "peel_states_partials",
                (true, true) => "peel_states_states",
                (false, true) => unreachable!("compact child ordered first"),
            };
            for (child, compact) in [(child1, compact1), (child2, compact2)] {
                if !compact {
                    self.check_index("partials buffer", child, self.partials.len())?;
                    if child == op.destination {
                        return Err(EvalError::General(format!(
                            "peeling destination {} aliases one of its children",
                            op.destination
                        )));
                    }
                }
            }
            self.pipeline(kernel)?;
            plan.push((op, kernel, child1, matrix1, compact1, child2, matrix2, compact2));
        }
        trace!("enqueueing {} peeling operations", operations.len());

        let command = self.queue.new_command_buffer();
        for &(op, kernel, child1, matrix1, compact1, child2, matrix2, compact2) in &plan {
            let pipeline = self.pipeline(kernel)?;
            let (groups, per_group) = self.pattern_grid(pipeline);
            let params = self.peel_params(rescale);
            // Every destination owns a scaling vector; it doubles as the
            // (unread) placeholder binding when rescaling is off.
            let scale_index = op.destination_scaling.unwrap_or(op.destination);

            let child_buffer = |index: usize, compact: bool| {
                if compact {
                    // Presence verified by `is_compact`.
                    self.tip_states[index].as_ref().unwrap_or(&self.partials[index])
                } else {
                    &self.partials[index]
                }
            };

            let encoder = command.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(pipeline);
            encoder.set_buffer(0, Some(&self.partials[op.destination]), 0);
            encoder.set_buffer(1, Some(&self.scale_factors[scale_index]), 0);
            encoder.set_buffer(2, Some(child_buffer(child1, compact1)), 0);
            encoder.set_buffer(3, Some(&self.matrices[matrix1]), 0);
            encoder.set_buffer(4, Some(child_buffer(child2, compact2)), 0);
            encoder.set_buffer(5, Some(&self.matrices[matrix2]), 0);
            encoder.set_bytes(
                6,
                std::mem::size_of::<PeelParams>() as u64,
                &params as *const PeelParams as *const std::ffi::c_void,
            );
            encoder.dispatch_thread_groups(groups, per_group);
            encoder.end_encoding();
        }
        command.commit();

        // Track the batch against every destination it writes; reads and
        // wait barriers resolve against this map.
        let owned = command.to_owned();
        for op in operations {
            self.pending.insert(op.destination, owned.clone());
        }
        Ok(())
    }

    fn wait_for_partials(&mut self, destinations: &[usize]) -> EvalResult<()> {
        for &destination in destinations {
            self.check_index("partials buffer", destination, self.partials.len())?;
            self.sync_buffer(destination);
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, scaling: usize) -> EvalResult<()> {
        self.check_index("scaling buffer", scaling, self.scale_factors.len())?;
        self.sync_all();
        Self::write_f32(
            &self.scale_factors[scaling],
            &vec![0.0; self.sizing.pattern_count],
        );
        Ok(())
    }

    fn root_log_likelihoods(&mut self, roots: &[RootSpec<'_>], out: &mut [f64]) -> EvalResult<()> {
        Self::check_len("site log-likelihood length", out.len(), self.sizing.pattern_count)?;
        for root in roots {
            self.check_index("partials buffer", root.partials, self.partials.len())?;
            Self::check_len(
                "category weights length",
                root.category_weights.len(),
                self.sizing.category_count,
            )?;
            Self::check_len(
                "state frequencies length",
                root.state_frequencies.len(),
                self.sizing.state_count,
            )?;
        }

        let pipeline = self.pipeline("integrate_root")?;
        let (groups, per_group) = self.pattern_grid(pipeline);
        let command = self.queue.new_command_buffer();
        for (index, root) in roots.iter().enumerate() {
            let weights = self.upload_f32(root.category_weights);
            let freqs = self.upload_f32(root.state_frequencies);
            let params = IntegrateParams {
                state_count: self.sizing.state_count as u32,
                pattern_count: self.sizing.pattern_count as u32,
                category_count: self.sizing.category_count as u32,
                accumulate: (index > 0) as u32,
                want_first: 0,
                want_second: 0,
            };
            let encoder = command.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(pipeline);
            encoder.set_buffer(0, Some(&self.site_out), 0);
            encoder.set_buffer(1, Some(&self.partials[root.partials]), 0);
            encoder.set_buffer(2, Some(&weights), 0);
            encoder.set_buffer(3, Some(&freqs), 0);
            encoder.set_bytes(
                4,
                std::mem::size_of::<IntegrateParams>() as u64,
                &params as *const IntegrateParams as *const std::ffi::c_void,
            );
            encoder.dispatch_thread_groups(groups, per_group);
            encoder.end_encoding();
        }
        command.commit();
        command.wait_until_completed();
        self.pending.clear();

        Self::read_f32(&self.site_out, out);
        for root in roots {
            self.apply_scale_factors(root.scale_buffers, out)?;
        }
        Ok(())
    }

    fn edge_log_likelihoods(
        &mut self,
        edges: &[EdgeSpec<'_>],
        out: &mut [f64],
        mut out_first: Option<&mut [f64]>,
        mut out_second: Option<&mut [f64]>,
    ) -> EvalResult<()> {
        Self::check_len("site log-likelihood length", out.len(), self.sizing.pattern_count)?;
        if let Some(first) = out_first.as_deref() {
            Self::check_len("first derivative length", first.len(), self.sizing.pattern_count)?;
        }
        if let Some(second) = out_second.as_deref() {
            Self::check_len(
                "second derivative length",
                second.len(),
                self.sizing.pattern_count,
            )?;
        }
        for edge in edges {
            self.check_index("partials buffer", edge.parent, self.partials.len())?;
            if !self.is_compact(edge.child) {
                self.check_index("partials buffer", edge.child, self.partials.len())?;
            }
            self.check_index("transition matrix buffer", edge.matrix, self.matrices.len())?;
            if out_first.is_some() && edge.first_derivative.is_none() {
                return Err(EvalError::General(
                    "first derivative output requested without a derivative matrix".to_string(),
                ));
            }
            if out_second.is_some()
                && (edge.second_derivative.is_none() || edge.first_derivative.is_none())
            {
                return Err(EvalError::General(
                    "second derivative output requested without derivative matrices".to_string(),
                ));
            }
            for buffer in [edge.first_derivative, edge.second_derivative]
                .into_iter()
                .flatten()
            {
                self.check_index("transition matrix buffer", buffer, self.matrices.len())?;
            }
            Self::check_len(
                "category weights length",
                edge.category_weights.len(),
                self.sizing.category_count,
            )?;
            Self::check_len(
                "state frequencies length",
                edge.state_frequencies.len(),
                self.sizing.state_count,
            )?;
        }

        let command = self.queue.new_command_buffer();
        for (index, edge) in edges.iter().enumerate() {
            let compact = self.is_compact(edge.child);
            let kernel = if compact {
                "integrate_edge_states"
            } else {
                "integrate_edge_partials"
            };
            let pipeline = self.pipeline(kernel)?;
            let (groups, per_group) = self.pattern_grid(pipeline);
            let weights = self.upload_f32(edge.category_weights);
            let freqs = self.upload_f32(edge.state_frequencies);
            let params = IntegrateParams {
                state_count: self.sizing.state_count as u32,
                pattern_count: self.sizing.pattern_count as u32,
                category_count: self.sizing.category_count as u32,
                accumulate: (index > 0) as u32,
                want_first: out_first.is_some() as u32,
                want_second: out_second.is_some() as u32,
            };
            // Derivative slots fall back to the probability matrix when the
            // caller asked for no derivatives; the kernel never reads them.
            let d1 = edge.first_derivative.unwrap_or(edge.matrix);
            let d2 = edge.second_derivative.unwrap_or(edge.matrix);
            let child = if compact {
                self.tip_states[edge.child]
                    .as_ref()
                    .unwrap_or(&self.partials[edge.child])
            } else {
                &self.partials[edge.child]
            };

            let encoder = command.new_compute_command_encoder();
            encoder.set_compute_pipeline_state(pipeline);
            encoder.set_buffer(0, Some(&self.site_out), 0);
            encoder.set_buffer(1, Some(&self.site_d1), 0);
            encoder.set_buffer(2, Some(&self.site_d2), 0);
            encoder.set_buffer(3, Some(&self.partials[edge.parent]), 0);
            encoder.set_buffer(4, Some(child), 0);
            encoder.set_buffer(5, Some(&self.matrices[edge.matrix]), 0);
            encoder.set_buffer(6, Some(&self.matrices[d1]), 0);
            encoder.set_buffer(7, Some(&self.matrices[d2]), 0);
            encoder.set_buffer(8, Some(&weights), 0);
            encoder.set_buffer(9, Some(&freqs), 0);
            encoder.set_bytes(
                10,
                std::mem::size_of::<IntegrateParams>() as u64,
                &params as *const IntegrateParams as *const std::ffi::c_void,
            );
            encoder.dispatch_thread_groups(groups, per_group);
            encoder.end_encoding();
        }
        command.commit();
        command.wait_until_completed();
        self.pending.clear();

        Self::read_f32(&self.site_out, out);
        if let Some(first) = out_first.as_deref_mut() {
            Self::read_f32(&self.site_d1, first);
        }
        if let Some(second) = out_second.as_deref_mut() {
            Self::read_f32(&self.site_d2, second);
        }
        for edge in edges {
            self.apply_scale_factors(edge.scale_buffers, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizing() -> InstanceSizing {
        InstanceSizing {
            state_count: 4,
            pattern_count: 8,
            category_count: 2,
            tip_count: 2,
            partials_buffer_count: 5,
            compact_buffer_count: 2,
            eigen_buffer_count: 1,
            matrix_buffer_count: 2,
        }
    }

    /// Device-dependent tests run only where a Metal device exists.
    fn backend() -> Option<MetalBackend> {
        let mut backend = MetalBackend::new(sizing()).ok()?;
        backend.initialize().ok()?;
        Some(backend)
    }

    #[test]
    fn partials_round_trip_within_f32_tolerance() {
        let Some(mut backend) = backend() else {
            return;
        };
        let data: Vec<f64> = (0..sizing().partials_len())
            .map(|i| (i as f64 + 1.0) / 97.0)
            .collect();
        backend.set_partials(2, &data).unwrap();
        let mut out = vec![0.0; data.len()];
        backend.get_partials(2, &mut out).unwrap();
        for (a, b) in data.iter().zip(&out) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn gpu_peel_matches_identity_product() {
        let Some(mut backend) = backend() else {
            return;
        };
        let len = sizing().partials_len();
        let mut identity = vec![0.0; sizing().matrix_len()];
        for c in 0..2 {
            for s in 0..4 {
                identity[c * 16 + s * 4 + s] = 1.0;
            }
        }
        backend.set_transition_matrix(0, &identity).unwrap();
        backend.set_transition_matrix(1, &identity).unwrap();

        let child1: Vec<f64> = (0..len).map(|i| ((i % 7) as f64 + 1.0) / 8.0).collect();
        let child2: Vec<f64> = (0..len).map(|i| ((i % 5) as f64 + 1.0) / 6.0).collect();
        backend.set_partials(2, &child1).unwrap();
        backend.set_partials(3, &child2).unwrap();

        backend
            .update_partials(&[PartialsOp::new(4, 2, 0, 3, 1)], false)
            .unwrap();
        backend.wait_for_partials(&[4]).unwrap();

        let mut out = vec![0.0; len];
        backend.get_partials(4, &mut out).unwrap();
        for i in 0..len {
            assert!((out[i] - child1[i] * child2[i]).abs() < 1e-5);
        }
    }
}
