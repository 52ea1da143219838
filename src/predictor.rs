use anyhow::{Result, anyhow, ensure};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tracing::info;

use crate::model::{ForwardMode, NetworkConfig, PredictionNet, StreamMode};
use crate::optim::{Adam, OptimizerConfig, clamp_gradients};

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

/// Both isolated decodings of a two-stream network.
pub struct Decomposition {
    /// Decoded from `y * action` alone.
    pub action: Tensor,
    /// Decoded from `y` alone.
    pub independent: Tensor,
}

/// Owns the prediction network, its parameters and its optimizer.
///
/// All inputs are expected pre-normalized: `x` is (B, 3K, H, W) f32,
/// `a` is (B, A) one-hot f32, `y` is (B, 3, H, W) f32.
pub struct Predictor {
    pub varmap: VarMap,
    net: PredictionNet,
    optimizer: Adam,
    device: Device,
    grad_clip: f64,
    num_actions: usize,
}

impl Predictor {
    pub fn new(
        device: &Device,
        network: &NetworkConfig,
        optimizer: &OptimizerConfig,
        num_actions: usize,
    ) -> Result<Self> {
        ensure!(optimizer.grad_clip > 0.0, "gradient clamp bound must be positive");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = PredictionNet::new(vb, network, num_actions)?;
        let named: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("parameter map lock poisoned"))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        let adam = Adam::new(named, optimizer.clone())?;
        Ok(Self {
            varmap,
            net,
            optimizer: adam,
            device: device.clone(),
            grad_clip: optimizer.grad_clip,
            num_actions,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn streams(&self) -> StreamMode {
        self.net.streams()
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.steps()
    }

    fn loss(&self, x: &Tensor, a: &Tensor, y: &Tensor) -> Result<Tensor> {
        let pred = self.net.forward(x, a, ForwardMode::Normal)?;
        ensure!(
            pred.dims() == y.dims(),
            "target shape {:?} does not match prediction shape {:?}",
            y.dims(),
            pred.dims()
        );
        Ok(candle_nn::loss::mse(&pred, y)?)
    }

    /// Loss and gradients, already clamped, without touching the parameters.
    pub fn clamped_gradients(&self, x: &Tensor, a: &Tensor, y: &Tensor) -> Result<(f32, GradStore)> {
        let loss = self.loss(x, a, y)?;
        let mut grads = loss.backward()?;
        clamp_gradients(&mut grads, &self.varmap.all_vars(), self.grad_clip)?;
        Ok((loss.to_scalar::<f32>()?, grads))
    }

    /// One optimizer step on an MSE loss with clamped gradients.
    pub fn fit(&mut self, x: &Tensor, a: &Tensor, y: &Tensor) -> Result<f32> {
        with_autorelease_pool(|| {
            let (loss, grads) = self.clamped_gradients(x, a, y)?;
            self.optimizer.step(&grads)?;
            Ok(loss)
        })
    }

    /// Loss without a parameter update.
    pub fn evaluate(&self, x: &Tensor, a: &Tensor, y: &Tensor) -> Result<f32> {
        with_autorelease_pool(|| Ok(self.loss(x, a, y)?.detach().to_scalar::<f32>()?))
    }

    /// Decoded next frame, still normalized.
    pub fn predict(&self, x: &Tensor, a: &Tensor) -> Result<Tensor> {
        Ok(self.net.forward(x, a, ForwardMode::Normal)?.detach())
    }

    /// Isolated action and action-independent decodings. Two-stream only.
    pub fn decompose(&self, x: &Tensor, a: &Tensor) -> Result<Decomposition> {
        ensure!(
            self.streams() == StreamMode::TwoStream,
            "decomposition needs a two-stream network"
        );
        let action = self.net.forward(x, a, ForwardMode::IsolateAction)?.detach();
        let independent = self
            .net
            .forward(x, a, ForwardMode::IsolateIndependent)?
            .detach();
        Ok(Decomposition {
            action,
            independent,
        })
    }

    /// Save model weights
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        info!(path = %path.as_ref().display(), "model saved");
        Ok(())
    }

    /// Load model weights
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path.as_ref())?;
        info!(path = %path.as_ref().display(), "model loaded");
        Ok(())
    }

    pub fn save_optimizer<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.optimizer.save_state(path)
    }

    pub fn load_optimizer<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.optimizer.load_state(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_config;

    const H: usize = 50;
    const W: usize = 48;

    fn batch(b: usize, num_actions: usize) -> (Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let x = Tensor::rand(-0.5f32, 0.5f32, (b, 12, H, W), &dev).unwrap();
        let idx: Vec<f32> = (0..b * num_actions)
            .map(|i| if i % num_actions == (i / num_actions) % num_actions { 1.0 } else { 0.0 })
            .collect();
        let a = Tensor::from_vec(idx, (b, num_actions), &dev).unwrap();
        let y = Tensor::rand(-0.5f32, 0.5f32, (b, 3, H, W), &dev).unwrap();
        (x, a, y)
    }

    fn predictor(streams: StreamMode) -> Predictor {
        Predictor::new(
            &Device::Cpu,
            &tiny_config(H, W, streams),
            &OptimizerConfig::default(),
            3,
        )
        .unwrap()
    }

    fn params(p: &Predictor) -> Vec<f32> {
        let mut out = Vec::new();
        for var in p.varmap.all_vars() {
            out.extend(var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap());
        }
        out
    }

    #[test]
    fn gradients_are_clamped_before_the_step() {
        let p = predictor(StreamMode::TwoStream);
        let (x, a, y) = batch(2, 3);
        // A target far from any plausible output makes raw gradients large.
        let y = (y * 50.0).unwrap();
        let (loss, grads) = p.clamped_gradients(&x, &a, &y).unwrap();
        assert!(loss.is_finite());
        let mut seen = 0;
        for var in p.varmap.all_vars() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let max = g.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
                assert!(max <= 0.1 + 1e-6, "gradient {max} escaped the clamp");
                seen += 1;
            }
        }
        assert!(seen > 0);
    }

    #[test]
    fn fit_updates_and_evaluate_does_not() {
        let mut p = predictor(StreamMode::Single);
        let (x, a, y) = batch(2, 3);
        let before = params(&p);
        let loss = p.evaluate(&x, &a, &y).unwrap();
        assert!(loss.is_finite());
        assert_eq!(params(&p), before);

        let fit_loss = p.fit(&x, &a, &y).unwrap();
        assert!((fit_loss - loss).abs() < 1e-4);
        assert_ne!(params(&p), before);
        assert_eq!(p.optimizer_steps(), 1);
    }

    #[test]
    fn predict_and_decompose_shapes() {
        let p = predictor(StreamMode::TwoStream);
        let (x, a, _) = batch(3, 3);
        assert_eq!(p.predict(&x, &a).unwrap().dims(), &[3, 3, H, W]);
        let d = p.decompose(&x, &a).unwrap();
        assert_eq!(d.action.dims(), &[3, 3, H, W]);
        assert_eq!(d.independent.dims(), &[3, 3, H, W]);

        let single = predictor(StreamMode::Single);
        assert!(single.decompose(&x, &a).is_err());
    }

    #[test]
    fn checkpoint_reproduces_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut trained = predictor(StreamMode::TwoStream);
        let (x, a, y) = batch(2, 3);
        trained.fit(&x, &a, &y).unwrap();
        trained.save(&path).unwrap();

        let mut fresh = predictor(StreamMode::TwoStream);
        fresh.load(&path).unwrap();
        let p1 = trained.predict(&x, &a).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let p2 = fresh.predict(&x, &a).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(p1, p2);
    }

    #[test]
    fn optimizer_state_restores_into_fresh_predictor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.safetensors");
        let mut trained = predictor(StreamMode::Single);
        let (x, a, y) = batch(2, 3);
        trained.fit(&x, &a, &y).unwrap();
        trained.fit(&x, &a, &y).unwrap();
        trained.save_optimizer(&path).unwrap();

        let mut fresh = predictor(StreamMode::Single);
        fresh.load_optimizer(&path).unwrap();
        assert_eq!(fresh.optimizer_steps(), 2);
    }

    #[test]
    fn mismatched_target_is_rejected() {
        let mut p = predictor(StreamMode::Single);
        let (x, a, _) = batch(2, 3);
        let y = Tensor::zeros((2, 12, H, W), DType::F32, &Device::Cpu).unwrap();
        assert!(p.fit(&x, &a, &y).is_err());
    }
}
