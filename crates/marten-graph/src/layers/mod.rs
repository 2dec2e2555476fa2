// Bundled layers
//
// Enough to exercise every engine path: a source, a weighted layer, the
// in-place family, explicit fan-out, and the two terminal losses.

pub mod activation;
pub mod fully_connected;
pub mod identity;
pub mod input;
pub mod loss;
pub mod multiout;

pub use activation::{ActivationLayer, ActivationType};
pub use fully_connected::FullyConnectedLayer;
pub use identity::IdentityLayer;
pub use input::InputLayer;
pub use loss::{CrossEntropyLossLayer, LossType, MseLossLayer};
pub use multiout::MultiOutLayer;
