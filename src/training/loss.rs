//! Categorical cross-entropy and accuracy on batches.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::ElementConversion;

/// Mean categorical cross-entropy between `logits` and one-hot targets
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (one_hot * log_probs).sum_dim(1).mean().neg()
}

/// Number of rows whose arg-max matches the target index
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch, _] = logits.dims();
    let predicted = logits.argmax(1).reshape([batch]);
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}
