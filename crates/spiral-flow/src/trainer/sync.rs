// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Cross-device gradient synchronization.

use crate::{FlowError, Result};

/// Averages, parameter by parameter, the gradient contributed by each device.
///
/// The reduction is an arithmetic mean, never a sum: for a fixed total batch
/// size the result must not depend on how many devices the batch was
/// sharded across. This is the single synchronization barrier of a training
/// step; no parameter update happens before it completes.
pub fn average_gradients(tower_gradients: &[Vec<f32>]) -> Result<Vec<f32>> {
    let first = tower_gradients.first().ok_or_else(|| {
        FlowError::InvalidArgument("gradient averaging needs at least one device".to_string())
    })?;
    for (rank, tower) in tower_gradients.iter().enumerate() {
        if tower.len() != first.len() {
            return Err(FlowError::Shape(format!(
                "device {rank} contributed {} gradients, expected {}",
                tower.len(),
                first.len()
            )));
        }
    }
    let norm = 1.0 / tower_gradients.len() as f32;
    let mut averaged = vec![0.0f32; first.len()];
    for tower in tower_gradients {
        for (acc, value) in averaged.iter_mut().zip(tower.iter()) {
            *acc += value * norm;
        }
    }
    Ok(averaged)
}

/// Rejects non-finite entries, naming the offending parameter index.
pub fn check_finite(label: &str, values: &[f32]) -> Result<()> {
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(FlowError::NonFinite(format!(
            "{label} has a non-finite entry at parameter {index}"
        )));
    }
    Ok(())
}
