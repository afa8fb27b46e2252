pub mod member_repository;
pub mod project_repository;
pub mod push_token_repository;

pub use member_repository::MemberRepository;
pub use project_repository::ProjectRepository;
pub use push_token_repository::PushTokenRepository;
