//! Group construction from configuration

use super::rttping::{RttPing, RttPingConfig};
use super::{Fallback, GroupOption, GroupType, LoadBalance, ProxyGroup, Relay, Selector, URLTest};
use crate::config::ProxyGroupConfig;
use crate::dns::DnsResolve;
use crate::outbound::{AnyProxy, Proxy};
use crate::provider::{CompatibleProvider, HealthCheck, ProxyProvider, VehicleType};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Health-check interval of inline proxies when the group sets none
const DEFAULT_GROUP_INTERVAL: u64 = 300;

/// Runtime inputs shared by every group
#[derive(Clone)]
pub struct GroupContext {
    /// Skip scheduled health checks
    pub suspended: bool,
    /// Used by the ping group to deduplicate endpoints
    pub resolver: Arc<dyn DnsResolve>,
}

/// A constructed group, both as its admin surface and as a dialable proxy
pub struct ParsedGroup {
    pub group: Arc<dyn ProxyGroup>,
    pub proxy: AnyProxy,
}

impl ParsedGroup {
    fn new<G: ProxyGroup + 'static>(group: Arc<G>) -> Self {
        ParsedGroup {
            proxy: Proxy::new(group.clone()),
            group,
        }
    }
}

/// Build one group. `proxies` must already hold every proxy and group the
/// config names; the group's inline proxies are registered in `providers`
/// under the group's name.
pub fn parse_proxy_group(
    config: &ProxyGroupConfig,
    proxies: &HashMap<String, AnyProxy>,
    providers: &mut HashMap<String, Arc<dyn ProxyProvider>>,
    ctx: &GroupContext,
) -> Result<ParsedGroup> {
    let option = GroupOption::from_config(config, ctx.suspended)?;
    let name = option.name.clone();
    let mut group_providers: Vec<Arc<dyn ProxyProvider>> = Vec::new();

    if !option.proxies.is_empty() {
        let members = option
            .proxies
            .iter()
            .map(|n| {
                proxies
                    .get(n)
                    .cloned()
                    .ok_or_else(|| Error::config(format!("group {}: '{}' not found", name, n)))
            })
            .collect::<Result<Vec<_>>>()?;

        if providers.contains_key(&name) {
            return Err(Error::config(format!("duplicate provider name: {}", name)));
        }

        let inline: Arc<dyn ProxyProvider> =
            Arc::new(CompatibleProvider::new(name.clone(), members, health_check(config, &option))?);
        providers.insert(name.clone(), inline.clone());
        group_providers.push(inline);
    }

    if !option.use_providers.is_empty() {
        let mut used = Vec::with_capacity(option.use_providers.len());
        for pd_name in &option.use_providers {
            let pd = providers
                .get(pd_name)
                .ok_or_else(|| Error::config(format!("group {}: '{}' not found", name, pd_name)))?;
            if pd.vehicle_type() == VehicleType::Compatible {
                return Err(Error::config(format!(
                    "proxy group {} can't contains in `use`",
                    pd_name
                )));
            }
            used.push(pd.clone());
        }

        if option.group_type == GroupType::Fallback {
            used.append(&mut group_providers);
            group_providers = used;
        } else {
            group_providers.append(&mut used);
        }
    }

    debug!(
        "building {} group {} over {} providers",
        option.group_type,
        name,
        group_providers.len()
    );

    Ok(match option.group_type {
        GroupType::Selector => ParsedGroup::new(Arc::new(Selector::new(&option, group_providers)?)),
        GroupType::URLTest => ParsedGroup::new(Arc::new(URLTest::new(&option, group_providers)?)),
        GroupType::Fallback => ParsedGroup::new(Arc::new(Fallback::new(&option, group_providers)?)),
        GroupType::LoadBalance => {
            ParsedGroup::new(Arc::new(LoadBalance::new(&option, group_providers)?))
        }
        GroupType::Relay => ParsedGroup::new(Arc::new(Relay::new(&option, group_providers)?)),
        GroupType::Http2Ping => ParsedGroup::new(RttPing::new(
            &option,
            group_providers,
            RttPingConfig::from_config(config)?,
            ctx.resolver.clone(),
        )?),
    })
}

/// Health check for a group's inline proxies. Manual groups never probe on
/// their own; the ping group measures through its pingers instead.
fn health_check(config: &ProxyGroupConfig, option: &GroupOption) -> HealthCheck {
    match option.group_type {
        GroupType::Selector | GroupType::Relay | GroupType::Http2Ping => {
            HealthCheck::new(String::new(), Duration::ZERO, true, option.suspended)
        }
        _ => HealthCheck::new(
            option.url.clone(),
            Duration::from_secs(config.interval.unwrap_or(DEFAULT_GROUP_INTERVAL)),
            option.lazy,
            option.suspended,
        )
        .with_expected_status(option.expected_status.clone()),
    }
}

/// Order groups so every group comes after the groups it lists in `proxies`.
pub fn sort_groups(groups: &[ProxyGroupConfig]) -> Result<Vec<&ProxyGroupConfig>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }

    let index: HashMap<&str, usize> = groups
        .iter()
        .enumerate()
        .map(|(i, g)| (g.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::New; groups.len()];
    let mut order = Vec::with_capacity(groups.len());

    fn visit<'a>(
        i: usize,
        groups: &'a [ProxyGroupConfig],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        order: &mut Vec<&'a ProxyGroupConfig>,
        path: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = path.iter().position(|&p| p == i).unwrap_or(0);
                let names: Vec<&str> = path[start..].iter().map(|&p| groups[p].name.as_str()).collect();
                return Err(Error::config(format!(
                    "loop is detected in ProxyGroup, please check following ProxyGroups: {:?}",
                    names
                )));
            }
            Mark::New => {}
        }
        marks[i] = Mark::Visiting;
        path.push(i);
        for dep in &groups[i].proxies {
            if let Some(&j) = index.get(dep.as_str()) {
                visit(j, groups, index, marks, order, path)?;
            }
        }
        path.pop();
        marks[i] = Mark::Done;
        order.push(&groups[i]);
        Ok(())
    }

    let mut path = Vec::new();
    for i in 0..groups.len() {
        visit(i, groups, &index, &mut marks, &mut order, &mut path)?;
    }

    let unique: HashSet<&str> = order.iter().map(|g| g.name.as_str()).collect();
    if unique.len() != order.len() {
        return Err(Error::config("duplicate proxy group name"));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::ProxyType;
    use crate::testing::{mock, provider};
    use async_trait::async_trait;
    use std::net::IpAddr;

    struct NoDns;

    #[async_trait]
    impl DnsResolve for NoDns {
        async fn resolve_all(&self, domain: &str) -> Result<Vec<IpAddr>> {
            Err(Error::dns(format!("no such host {}", domain)))
        }
    }

    fn ctx() -> GroupContext {
        GroupContext {
            suspended: true,
            resolver: Arc::new(NoDns),
        }
    }

    fn group(yaml: &str) -> ProxyGroupConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn proxy_map() -> HashMap<String, AnyProxy> {
        ["a", "b", "c"].iter().map(|n| (n.to_string(), mock(n))).collect()
    }

    #[tokio::test]
    async fn test_builds_each_type() {
        let proxies = proxy_map();
        for (kind, ty) in [
            ("select", ProxyType::Selector),
            ("url-test", ProxyType::URLTest),
            ("fallback", ProxyType::Fallback),
            ("load-balance", ProxyType::LoadBalance),
            ("relay", ProxyType::Relay),
            ("http2ping", ProxyType::Http2Ping),
        ] {
            let mut providers = HashMap::new();
            let config = group(&format!("{{ name: g, type: {}, proxies: [a, b] }}", kind));
            let parsed = parse_proxy_group(&config, &proxies, &mut providers, &ctx()).unwrap();
            assert_eq!(parsed.proxy.proxy_type(), ty);
            assert_eq!(parsed.proxy.name(), "g");
            assert_eq!(parsed.group.all(), vec!["a", "b"]);
            assert_eq!(providers["g"].vehicle_type(), VehicleType::Compatible);
            parsed.proxy.close().await.unwrap();
        }
    }

    #[test]
    fn test_config_errors() {
        let proxies = proxy_map();
        let mut providers = HashMap::new();

        let unknown_type = group("{ name: g, type: random, proxies: [a] }");
        assert!(parse_proxy_group(&unknown_type, &proxies, &mut providers, &ctx()).is_err());

        let missing = group("{ name: g, type: select }");
        assert!(parse_proxy_group(&missing, &proxies, &mut providers, &ctx()).is_err());

        let unknown_proxy = group("{ name: g, type: select, proxies: [zzz] }");
        let err = parse_proxy_group(&unknown_proxy, &proxies, &mut providers, &ctx())
            .err()
            .unwrap();
        assert!(err.to_string().contains("'zzz' not found"));

        let unknown_provider = group("{ name: g, type: select, use: [nope] }");
        assert!(parse_proxy_group(&unknown_provider, &proxies, &mut providers, &ctx()).is_err());

        let bad_strategy = group("{ name: g, type: load-balance, proxies: [a], strategy: random }");
        assert!(matches!(
            parse_proxy_group(&bad_strategy, &proxies, &mut HashMap::new(), &ctx()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_and_compatible_providers() {
        let proxies = proxy_map();
        let mut providers: HashMap<String, Arc<dyn ProxyProvider>> = HashMap::new();
        providers.insert("g".to_string(), provider("g", vec![mock("x")]));

        let dup = group("{ name: g, type: select, proxies: [a] }");
        let err = parse_proxy_group(&dup, &proxies, &mut providers, &ctx()).err().unwrap();
        assert!(err.to_string().contains("duplicate provider name"));

        let inline = group("{ name: inline, type: select, proxies: [a] }");
        parse_proxy_group(&inline, &proxies, &mut providers, &ctx()).unwrap();

        let uses_inline = group("{ name: other, type: select, use: [inline] }");
        let err = parse_proxy_group(&uses_inline, &proxies, &mut providers, &ctx())
            .err()
            .unwrap();
        assert!(err.to_string().contains("can't contains in `use`"));
    }

    #[test]
    fn test_provider_order() {
        let proxies = proxy_map();
        let mut providers: HashMap<String, Arc<dyn ProxyProvider>> = HashMap::new();
        providers.insert("sub".to_string(), provider("sub", vec![mock("s1")]));

        let fallback = group("{ name: fb, type: fallback, proxies: [a], use: [sub] }");
        let parsed = parse_proxy_group(&fallback, &proxies, &mut providers, &ctx()).unwrap();
        assert_eq!(parsed.group.all(), vec!["s1", "a"]);

        let select = group("{ name: sel, type: select, proxies: [a], use: [sub] }");
        let parsed = parse_proxy_group(&select, &proxies, &mut providers, &ctx()).unwrap();
        assert_eq!(parsed.group.all(), vec!["a", "s1"]);
    }

    #[test]
    fn test_sort_groups() {
        let groups: Vec<ProxyGroupConfig> = serde_yaml::from_str(
            r#"
- { name: top, type: select, proxies: [mid, a] }
- { name: mid, type: fallback, proxies: [leaf, b] }
- { name: leaf, type: url-test, proxies: [a, b] }
- { name: solo, type: select, proxies: [c] }
"#,
        )
        .unwrap();
        let order: Vec<&str> = sort_groups(&groups)
            .unwrap()
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(order, vec!["leaf", "mid", "top", "solo"]);
    }

    #[test]
    fn test_sort_groups_detects_cycle() {
        let groups: Vec<ProxyGroupConfig> = serde_yaml::from_str(
            r#"
- { name: x, type: select, proxies: [y] }
- { name: y, type: select, proxies: [z] }
- { name: z, type: select, proxies: [x, a] }
"#,
        )
        .unwrap();
        let err = sort_groups(&groups).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("loop is detected"));
    }
}
