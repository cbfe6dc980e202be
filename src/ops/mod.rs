pub mod softmax;
pub mod stable_accumulator;
