use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Optimizer knobs, including the element-wise gradient clamp applied before
/// every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Gradients are clamped to `[-grad_clip, grad_clip]`.
    pub grad_clip: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            grad_clip: 0.1,
        }
    }
}

/// Clamp every gradient in `grads` that belongs to one of `vars`.
pub fn clamp_gradients(grads: &mut GradStore, vars: &[Var], bound: f64) -> Result<()> {
    let bound = bound as f32;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            let clamped = g.clamp(-bound, bound)?;
            grads.insert(var.as_tensor(), clamped);
        }
    }
    Ok(())
}

// =============================================================================
// Adam
// =============================================================================

struct VarAdam {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam over named parameters. Moments are keyed by parameter name so they
/// can be restored into a freshly built network.
pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    config: OptimizerConfig,
}

impl Adam {
    pub fn new(vars: Vec<(String, Var)>, config: OptimizerConfig) -> Result<Self> {
        let mut vars = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let dtype = var.dtype();
                let shape = var.shape();
                let device = var.device();
                let first_moment = Var::zeros(shape, dtype, device)?;
                let second_moment = Var::zeros(shape, dtype, device)?;
                Ok(VarAdam {
                    name,
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        vars.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            vars,
            step_t: 0,
            config,
        })
    }

    pub fn steps(&self) -> usize {
        self.step_t
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.config.learning_rate;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));
        for var in self.vars.iter() {
            let Some(g) = grads.get(&var.var) else {
                continue;
            };
            let m = ((var.first_moment.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((var.second_moment.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let denom = ((&v * scale_v)?.sqrt()? + self.config.eps)?;
            let update = (((&m * scale_m)? / denom)? * lr)?;
            var.var.set(&(var.var.as_tensor() - update)?)?;
            var.first_moment.set(&m)?;
            var.second_moment.set(&v)?;
        }
        Ok(())
    }

    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(
            "adam.step_t".to_string(),
            Tensor::from_slice(&[self.step_t as u32], 1, &Device::Cpu)?,
        );
        for var in self.vars.iter() {
            tensors.insert(format!("adam.m.{}", var.name), var.first_moment.as_tensor().detach());
            tensors.insert(format!("adam.v.{}", var.name), var.second_moment.as_tensor().detach());
        }
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    /// Restores moments and the step count. Either every moment is restored or,
    /// on error, the optimizer is left freshly initialized.
    pub fn load_state<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let restored = self.read_state(path.as_ref());
        match restored {
            Ok((step_t, moments)) => {
                for (var, (m, v)) in self.vars.iter().zip(moments.iter()) {
                    var.first_moment.set(m)?;
                    var.second_moment.set(v)?;
                }
                self.step_t = step_t;
                Ok(())
            }
            Err(err) => {
                self.reset()?;
                Err(err)
            }
        }
    }

    fn read_state(&self, path: &Path) -> Result<(usize, Vec<(Tensor, Tensor)>)> {
        let device = self
            .vars
            .first()
            .map(|v| v.var.device().clone())
            .unwrap_or(Device::Cpu);
        let tensors = candle_core::safetensors::load(path, &device)
            .with_context(|| format!("Failed to read optimizer state {}", path.display()))?;
        let step_t = tensors
            .get("adam.step_t")
            .context("Missing adam.step_t in optimizer state")?
            .to_vec1::<u32>()?;
        let step_t = step_t.first().copied().unwrap_or(0) as usize;
        let mut moments = Vec::with_capacity(self.vars.len());
        for var in self.vars.iter() {
            let lookup = |kind: &str| -> Result<Tensor> {
                let tensor = tensors
                    .get(&format!("adam.{kind}.{}", var.name))
                    .with_context(|| format!("Missing adam.{kind} of {} in optimizer state", var.name))?;
                anyhow::ensure!(
                    tensor.dims() == var.var.dims(),
                    "adam.{kind} of {} has shape {:?}, parameter has {:?}",
                    var.name,
                    tensor.dims(),
                    var.var.dims()
                );
                Ok(tensor.to_dtype(var.var.dtype())?)
            };
            let m = lookup("m")?;
            let v = lookup("v")?;
            moments.push((m, v));
        }
        Ok((step_t, moments))
    }

    fn reset(&mut self) -> Result<()> {
        for var in self.vars.iter() {
            var.first_moment.set(&var.first_moment.zeros_like()?)?;
            var.second_moment.set(&var.second_moment.zeros_like()?)?;
        }
        self.step_t = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn clamp_bounds_every_gradient() {
        let w = Var::from_vec(vec![3.0f32, -2.0, 0.01], 3, &Device::Cpu).unwrap();
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        clamp_gradients(&mut grads, &[w.clone()], 0.1).unwrap();
        let g = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g[0], 0.1);
        assert_eq!(g[1], -0.1);
        assert!((g[2] - 0.02).abs() < 1e-6);
    }

    #[test]
    fn step_moves_against_gradient() {
        let w = Var::from_vec(vec![1.0f32, -1.0], 2, &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![("w".to_string(), w.clone())], OptimizerConfig::default()).unwrap();
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        let after = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!(after[0] < 1.0);
        assert!(after[1] > -1.0);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.safetensors");
        let w = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let target = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![("w".to_string(), w.clone())], OptimizerConfig::default()).unwrap();
        for _ in 0..3 {
            let loss = (w.as_tensor() - &target).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.step(&loss.backward().unwrap()).unwrap();
        }
        opt.save_state(&path).unwrap();

        let w2 = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let mut restored = Adam::new(vec![("w".to_string(), w2)], OptimizerConfig::default()).unwrap();
        restored.load_state(&path).unwrap();
        assert_eq!(restored.steps(), 3);
        let m0 = opt.vars[0].first_moment.as_tensor().to_vec1::<f32>().unwrap();
        let m1 = restored.vars[0]
            .first_moment
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(m0, m1);
    }

    #[test]
    fn failed_load_leaves_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.safetensors");
        let a = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut opt = Adam::new(vec![("a".to_string(), a.clone())], OptimizerConfig::default()).unwrap();
        for _ in 0..3 {
            let loss = (a.as_tensor() - 1.0).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.step(&loss.backward().unwrap()).unwrap();
        }
        opt.save_state(&path).unwrap();

        // `b` has no moments in the saved state
        let a2 = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let b2 = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let mut wider = Adam::new(
            vec![("a".to_string(), a2), ("b".to_string(), b2)],
            OptimizerConfig::default(),
        )
        .unwrap();
        let err = wider.load_state(&path).unwrap_err();
        assert!(err.to_string().contains("adam.m of b"), "{err}");
        assert_eq!(wider.steps(), 0);
        let m = wider.vars[0].first_moment.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(m, vec![0.0, 0.0]);
    }

    #[test]
    fn moment_shape_must_match_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt.safetensors");
        let w = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let opt = Adam::new(vec![("w".to_string(), w)], OptimizerConfig::default()).unwrap();
        opt.save_state(&path).unwrap();

        let w2 = Var::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let mut other = Adam::new(vec![("w".to_string(), w2)], OptimizerConfig::default()).unwrap();
        assert!(other.load_state(&path).is_err());
        assert_eq!(other.steps(), 0);
    }
}
