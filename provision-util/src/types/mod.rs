mod device_id;
mod id_scope;
mod registration_id;

pub use device_id::DeviceId;
pub use id_scope::IdScope;
pub use registration_id::{InvalidRegistrationId, RegistrationId};
