// Domain model types for the transcoding core.

mod content;
mod id;
mod media;
mod session;

pub use content::ContentRecord;
pub use id::{generate_id, MediaId, SessionId};
pub use media::{
    AbrRendition, DeviceProfile, EncodingProfile, MediaDescriptor, PlayMethod, PlaybackDecision,
    Resolution, StreamingContainer, TranscodeRequest,
};
pub use session::{ProgressUpdate, Session, SessionStatus};
