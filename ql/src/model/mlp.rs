//! Small fully-connected network on `ndarray`: ReLU hidden layers, linear output layer.
//!
//! Training is explicit: [Mlp::forward_trace] keeps the activations of a batch,
//! [Mlp::backward] turns a gradient on the output into parameter gradients and
//! [Adam::step] applies them.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Weights are stored as `[inputs, outputs]`, so a batch `[B, inputs]` maps via `x·W + b`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseLayer {
    fn zeros_like(other: &DenseLayer) -> Self {
        Self {
            weights: Array2::zeros(other.weights.raw_dim()),
            bias: Array1::zeros(other.bias.raw_dim()),
        }
    }

    fn squared_sum(&self) -> f32 {
        self.weights.iter().chain(self.bias.iter()).map(|g| g * g).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<DenseLayer>,
}

impl Mlp {
    /// Xavier-uniform initialized network.
    ///
    /// # Arguments
    /// * `layer_sizes` `[inputs, hidden.., outputs]`; at least two entries
    pub fn new<R: Rng>(
        layer_sizes: &[usize],
        rng: &mut R,
    ) -> Self {
        assert!(layer_sizes.len() >= 2, "need at least an input and an output layer");
        let layers = layer_sizes
            .windows(2)
            .map(|w| {
                let (fan_in, fan_out) = (w[0], w[1]);
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                DenseLayer {
                    weights: Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit)),
                    bias: Array1::from_elem(fan_out, 0.01),
                }
            })
            .collect();
        Self { layers }
    }

    pub fn layer_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.layers.len() + 1);
        if let Some(first) = self.layers.first() {
            sizes.push(first.weights.nrows());
        }
        sizes.extend(self.layers.iter().map(|l| l.weights.ncols()));
        sizes
    }

    /// True if all layers chain up and the network has exactly the given layer sizes.
    ///
    /// Deserialized parameters are only usable if this holds.
    pub fn has_architecture(
        &self,
        layer_sizes: &[usize],
    ) -> bool {
        let chained = self.layers.iter().all(|l| l.weights.ncols() == l.bias.len())
            && self.layers.windows(2).all(|w| w[0].weights.ncols() == w[1].weights.nrows());
        chained && self.layer_sizes() == layer_sizes
    }

    pub fn forward(
        &self,
        input: ArrayView1<f32>,
    ) -> Array1<f32> {
        let batch = input.insert_axis(Axis(0));
        self.forward_batch(batch).index_axis_move(Axis(0), 0)
    }

    pub fn forward_batch(
        &self,
        input: ArrayView2<f32>,
    ) -> Array2<f32> {
        let last = self.layers.len() - 1;
        self.layers.iter().enumerate().fold(input.to_owned(), |x, (i, layer)| {
            let z = x.dot(&layer.weights) + &layer.bias;
            if i < last { z.mapv_into(relu) } else { z }
        })
    }

    /// Forward pass keeping every layer's activation for a following [Self::backward].
    pub fn forward_trace(
        &self,
        input: ArrayView2<f32>,
    ) -> ForwardTrace {
        let last = self.layers.len() - 1;
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_owned());
        for (i, layer) in self.layers.iter().enumerate() {
            let z = activations[i].dot(&layer.weights) + &layer.bias;
            activations.push(if i < last { z.mapv_into(relu) } else { z });
        }
        ForwardTrace { activations }
    }

    /// Backpropagation of `output_grad` (`dLoss/dOutput`, shape `[B, outputs]`) through the traced batch.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        output_grad: Array2<f32>,
    ) -> Gradients {
        debug_assert_eq!(output_grad.dim(), trace.output().dim());
        let mut delta = output_grad;
        let mut layers = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let input = &trace.activations[i];
            let weights = input.t().dot(&delta);
            let bias = delta.sum_axis(Axis(0));
            if i > 0 {
                let mut upstream = delta.dot(&layer.weights.t());
                // ReLU passes gradient only where it was active
                Zip::from(&mut upstream).and(input).for_each(|d, &a| {
                    if a <= 0.0 {
                        *d = 0.0
                    }
                });
                delta = upstream;
            }
            layers.push(DenseLayer { weights, bias });
        }
        layers.reverse();
        Gradients { layers }
    }
}

fn relu(x: f32) -> f32 { x.max(0.0) }

pub struct ForwardTrace {
    /// input followed by each layer's output
    activations: Vec<Array2<f32>>,
}

impl ForwardTrace {
    pub fn output(&self) -> &Array2<f32> {
        &self.activations[self.activations.len() - 1]
    }
}

/// Parameter gradients, shaped like the [Mlp] they were computed for.
#[derive(Clone, Debug)]
pub struct Gradients {
    layers: Vec<DenseLayer>,
}

impl Gradients {
    pub fn global_norm(&self) -> f32 {
        self.layers.iter().map(DenseLayer::squared_sum).sum::<f32>().sqrt()
    }

    /// Scales all gradients down so that their global L2 norm is at most `max_norm`.
    /// Returns the norm before clipping.
    pub fn clip_global_norm(
        &mut self,
        max_norm: f32,
    ) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            let scale = max_norm / norm;
            for layer in &mut self.layers {
                layer.weights.mapv_inplace(|g| g * scale);
                layer.bias.mapv_inplace(|g| g * scale);
            }
        }
        norm
    }
}

/// Adam optimizer; its moment estimates are part of a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: u64,
    first_moment: Vec<DenseLayer>,
    second_moment: Vec<DenseLayer>,
}

impl Adam {
    pub fn new(
        model: &Mlp,
        learning_rate: f32,
    ) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            first_moment: model.layers.iter().map(DenseLayer::zeros_like).collect(),
            second_moment: model.layers.iter().map(DenseLayer::zeros_like).collect(),
        }
    }

    /// True if the moment estimates have the shapes of `model`'s parameters
    pub fn fits(
        &self,
        model: &Mlp,
    ) -> bool {
        let same_shapes = |moments: &[DenseLayer]| {
            moments.len() == model.layers.len()
                && moments.iter().zip(&model.layers).all(|(m, l)| {
                    m.weights.dim() == l.weights.dim() && m.bias.dim() == l.bias.dim()
                })
        };
        same_shapes(&self.first_moment) && same_shapes(&self.second_moment)
    }

    pub fn step_count(&self) -> u64 { self.step }

    pub fn learning_rate(&self) -> f32 { self.learning_rate }

    /// Changes the step size; moment estimates and step count are kept.
    pub fn set_learning_rate(
        &mut self,
        learning_rate: f32,
    ) {
        self.learning_rate = learning_rate;
    }

    pub fn step(
        &mut self,
        model: &mut Mlp,
        gradients: &Gradients,
    ) {
        debug_assert!(self.fits(model));
        self.step += 1;
        let t = self.step.min(i32::MAX as u64) as i32;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let step_size = self.learning_rate * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));

        let update = |p: &mut f32, m: &mut f32, v: &mut f32, g: f32| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            *p -= step_size * *m / (v.sqrt() + epsilon);
        };

        for (((layer, m), v), g) in model
            .layers
            .iter_mut()
            .zip(self.first_moment.iter_mut())
            .zip(self.second_moment.iter_mut())
            .zip(&gradients.layers)
        {
            Zip::from(&mut layer.weights)
                .and(&mut m.weights)
                .and(&mut v.weights)
                .and(&g.weights)
                .for_each(|p, m, v, &g| update(p, m, v, g));
            Zip::from(&mut layer.bias)
                .and(&mut m.bias)
                .and(&mut v.bias)
                .and(&g.bias)
                .for_each(|p, m, v, &g| update(p, m, v, g));
        }
    }
}
