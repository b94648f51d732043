// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Adam update applied once per synchronized step.

use crate::{FlowError, Result};

const BETA1: f32 = 0.9;
const BETA2: f32 = 0.999;
const EPSILON: f32 = 1e-8;

/// Adam optimizer over a flat parameter vector.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    first_moment: Vec<f32>,
    second_moment: Vec<f32>,
    timestep: u64,
}

impl Adam {
    pub fn new(learning_rate: f32, parameter_len: usize) -> Self {
        Self {
            learning_rate,
            first_moment: vec![0.0; parameter_len],
            second_moment: vec![0.0; parameter_len],
            timestep: 0,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Applies the averaged gradient in place.
    pub fn step(&mut self, params: &mut [f32], gradients: &[f32]) -> Result<()> {
        if params.len() != self.first_moment.len() || gradients.len() != params.len() {
            return Err(FlowError::Shape(format!(
                "optimizer state holds {} parameters, got {} params / {} gradients",
                self.first_moment.len(),
                params.len(),
                gradients.len()
            )));
        }
        self.timestep += 1;
        let bias1 = 1.0 - BETA1.powi(self.timestep as i32);
        let bias2 = 1.0 - BETA2.powi(self.timestep as i32);
        for i in 0..params.len() {
            let g = gradients[i];
            self.first_moment[i] = BETA1 * self.first_moment[i] + (1.0 - BETA1) * g;
            self.second_moment[i] = BETA2 * self.second_moment[i] + (1.0 - BETA2) * g * g;
            let m_hat = self.first_moment[i] / bias1;
            let v_hat = self.second_moment[i] / bias2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + EPSILON);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_against_the_gradient() {
        let mut optimizer = Adam::new(0.1, 2);
        let mut params = vec![1.0f32, -1.0];
        optimizer.step(&mut params, &[1.0, -1.0]).unwrap();
        assert!(params[0] < 1.0);
        assert!(params[1] > -1.0);
    }

    #[test]
    fn repeated_steps_descend_a_quadratic() {
        let mut optimizer = Adam::new(0.05, 1);
        let mut params = vec![2.0f32];
        for _ in 0..200 {
            let grad = 2.0 * params[0];
            optimizer.step(&mut params, &[grad]).unwrap();
        }
        assert!(params[0].abs() < 0.1);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut optimizer = Adam::new(0.1, 2);
        let mut params = vec![0.0f32; 2];
        assert!(matches!(
            optimizer.step(&mut params, &[1.0]),
            Err(FlowError::Shape(_))
        ));
    }
}
