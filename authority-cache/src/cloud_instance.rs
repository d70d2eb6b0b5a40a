use std::collections::HashMap;

use serde::Deserialize;

use crate::authority::Environment;

/// 組み込みのクラウドインスタンスの定義
struct BuiltinCloudInstance {
    name: &'static str,
    preferred_network: &'static str,
    preferred_cache: &'static str,
    aliases: &'static [&'static str],
}

/// 既知のクラウドインスタンス
///
/// パブリッククラウドと各ソブリンクラウドの、ネットワーク呼び出しに使用するホスト、
/// トークンキャッシュのキーに使用するホスト、および同一視されるホストの一覧。
const BUILTIN_CLOUD_INSTANCES: &[BuiltinCloudInstance] = &[
    BuiltinCloudInstance {
        name: "public",
        preferred_network: "login.microsoftonline.com",
        preferred_cache: "login.windows.net",
        aliases: &[
            "login.microsoftonline.com",
            "login.windows.net",
            "login.microsoft.com",
            "sts.windows.net",
        ],
    },
    BuiltinCloudInstance {
        name: "china",
        preferred_network: "login.partner.microsoftonline.cn",
        preferred_cache: "login.partner.microsoftonline.cn",
        aliases: &["login.partner.microsoftonline.cn", "login.chinacloudapi.cn"],
    },
    BuiltinCloudInstance {
        name: "germany",
        preferred_network: "login.microsoftonline.de",
        preferred_cache: "login.microsoftonline.de",
        aliases: &["login.microsoftonline.de"],
    },
    BuiltinCloudInstance {
        name: "us-government",
        preferred_network: "login.microsoftonline.us",
        preferred_cache: "login.microsoftonline.us",
        aliases: &["login.microsoftonline.us", "login.usgovcloudapi.net"],
    },
    BuiltinCloudInstance {
        name: "us-government-legacy",
        preferred_network: "login-us.microsoftonline.com",
        preferred_cache: "login-us.microsoftonline.com",
        aliases: &["login-us.microsoftonline.com"],
    },
];

/// クラウドインスタンス
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudInstance {
    /// クラウドインスタンスの名前
    name: String,
    /// ネットワーク呼び出しに使用するホスト
    preferred_network: Environment,
    /// トークンキャッシュのキーに使用するホスト
    preferred_cache: Environment,
    /// 同一視されるホスト（優先順）
    aliases: Vec<Environment>,
}

impl CloudInstance {
    pub fn new(
        name: impl Into<String>,
        preferred_network: Environment,
        preferred_cache: Environment,
        aliases: Vec<Environment>,
    ) -> Self {
        Self {
            name: name.into(),
            preferred_network,
            preferred_cache,
            aliases,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preferred_network(&self) -> &Environment {
        &self.preferred_network
    }

    pub fn preferred_cache(&self) -> &Environment {
        &self.preferred_cache
    }

    pub fn aliases(&self) -> &[Environment] {
        &self.aliases
    }
}

impl BuiltinCloudInstance {
    fn to_cloud_instance(&self) -> CloudInstance {
        CloudInstance {
            name: self.name.to_string(),
            preferred_network: Environment::from_static(self.preferred_network),
            preferred_cache: Environment::from_static(self.preferred_cache),
            aliases: self
                .aliases
                .iter()
                .copied()
                .map(Environment::from_static)
                .collect(),
        }
    }
}

/// クラウドインスタンス表
///
/// 構築後は読み取り専用であり、ロックせずに複数のタスクから参照できる。
#[derive(Debug, Clone)]
pub struct CloudInstanceTable {
    instances: Vec<CloudInstance>,
    /// 環境をキー、`instances`のインデックスを値としたハッシュマップ
    by_alias: HashMap<Environment, usize>,
}

impl CloudInstanceTable {
    /// 組み込みのクラウドインスタンスのみを含む表を作成する。
    pub fn builtin() -> Self {
        Self::from_instances(
            BUILTIN_CLOUD_INSTANCES
                .iter()
                .map(BuiltinCloudInstance::to_cloud_instance)
                .collect(),
        )
    }

    /// 組み込みのクラウドインスタンスに、指定したクラウドインスタンスを追加した表を作成する。
    ///
    /// # Arguments
    ///
    /// * `extra` - 追加するクラウドインスタンス
    ///
    /// # Notes
    ///
    /// 同じ環境が複数のクラウドインスタンスに含まれる場合は、後に追加したクラウドインスタンスが優先される。
    pub fn with_instances(extra: impl IntoIterator<Item = CloudInstance>) -> Self {
        let instances = BUILTIN_CLOUD_INSTANCES
            .iter()
            .map(BuiltinCloudInstance::to_cloud_instance)
            .chain(extra)
            .collect();
        Self::from_instances(instances)
    }

    fn from_instances(instances: Vec<CloudInstance>) -> Self {
        let mut by_alias = HashMap::new();
        for (index, instance) in instances.iter().enumerate() {
            for alias in instance.aliases() {
                if let Some(previous) = by_alias.insert(alias.clone(), index)
                    && previous != index
                {
                    tracing::warn!(
                        environment = %alias,
                        previous = %instances[previous].name,
                        current = %instance.name,
                        "Environment is claimed by multiple cloud instances"
                    );
                }
            }
        }
        Self {
            instances,
            by_alias,
        }
    }

    /// 環境を含むクラウドインスタンスを検索する。
    pub fn find(&self, environment: &Environment) -> Option<&CloudInstance> {
        self.by_alias
            .get(environment)
            .and_then(|index| self.instances.get(*index))
    }

    pub fn instances(&self) -> impl Iterator<Item = &CloudInstance> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for CloudInstanceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(value: &str) -> Environment {
        Environment::parse(value).unwrap()
    }

    #[test]
    fn builtin_table_resolves_every_public_alias() {
        let table = CloudInstanceTable::builtin();
        for alias in ["login.microsoftonline.com", "LOGIN.windows.net", "sts.windows.net"] {
            let instance = table.find(&env(alias)).unwrap();
            assert_eq!(instance.name(), "public");
            assert_eq!(instance.preferred_network().as_str(), "login.microsoftonline.com");
            assert_eq!(instance.preferred_cache().as_str(), "login.windows.net");
        }
        assert!(table.find(&env("login.contoso.com")).is_none());
    }

    #[test]
    fn extra_instances_are_appended_and_win_conflicts() {
        let contoso = CloudInstance::new(
            "contoso",
            env("login.contoso.com"),
            env("login.contoso.com"),
            vec![env("login.contoso.com"), env("login.chinacloudapi.cn")],
        );
        let table = CloudInstanceTable::with_instances([contoso]);

        assert_eq!(table.len(), BUILTIN_CLOUD_INSTANCES.len() + 1);
        assert_eq!(table.find(&env("login.contoso.com")).unwrap().name(), "contoso");
        assert_eq!(table.find(&env("login.chinacloudapi.cn")).unwrap().name(), "contoso");
        assert_eq!(
            table.find(&env("login.partner.microsoftonline.cn")).unwrap().name(),
            "china"
        );
    }
}
