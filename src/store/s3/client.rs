use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;

use crate::config::S3Config;

pub struct S3Client {
    client: Client,
}

impl S3Client {
    pub async fn new(config: S3Config) -> Self {
        let mut aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(profile) = &config.profile {
            aws_config = aws_config.profile_name(profile);
        }

        let sdk_config = aws_config.load().await;
        let client = Client::new(&sdk_config);

        Self { client }
    }

    pub fn into_inner(self) -> Client {
        self.client
    }
}
