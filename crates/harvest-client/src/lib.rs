pub mod extractor;
pub mod fetcher;
pub mod normalize;
pub mod robots;
pub mod rules;

pub use extractor::{RuleExtractor, RuleExtractorFactory};
pub use fetcher::{DEFAULT_USER_AGENT, ReqwestFetcher};
pub use normalize::FieldNormalizer;
pub use robots::{ReqwestRobotsSource, RobotsTxtPolicy};
pub use rules::{CompiledRules, RuleSet};
