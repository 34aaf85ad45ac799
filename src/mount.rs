//! Mount configuration and the URL → filesystem path jail.

use std::path::{Component, MAIN_SEPARATOR_STR, Path, PathBuf, is_separator};
use std::sync::Arc;

/// 绑定到文件系统根目录的路由前缀，启动后不再修改。
#[derive(Clone, Debug)]
pub struct MountConfig {
    route: String,
    root: PathBuf,
    allow_upload: bool,
    allow_delete: bool,
}

/// 映射到挂载点内的请求路径；`os_path` 始终位于挂载根之下。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub url_path: String,
    pub os_path: PathBuf,
}

impl MountConfig {
    pub fn new(route: impl Into<String>, root: PathBuf, allow_upload: bool, allow_delete: bool) -> Self {
        Self {
            route: route.into(),
            root,
            allow_upload,
            allow_delete,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn allow_upload(&self) -> bool {
        self.allow_upload
    }

    pub fn allow_delete(&self) -> bool {
        self.allow_delete
    }

    /// 去掉首尾斜杠的路由；挂载在 `/` 时为空。
    fn route_key(&self) -> &str {
        self.route.trim_matches('/')
    }

    /// 将解码后的请求路径映射到文件系统。
    ///
    /// 先清理去掉路由后的剩余部分，再拼接到根目录上，任意多的 `..` 都无法越过根目录。
    pub fn resolve(&self, url_path: &str) -> ResolvedPath {
        let relative = self.strip_route(url_path);
        let native = relative.replace('/', MAIN_SEPARATOR_STR);

        let mut os_path = self.root.clone();
        for segment in clean_segments(&native) {
            // 拒绝盘符前缀等会替换根目录的组件
            let mut components = Path::new(segment).components();
            if let (Some(Component::Normal(part)), None) = (components.next(), components.next()) {
                os_path.push(part);
            }
        }

        ResolvedPath {
            url_path: url_path.to_string(),
            os_path,
        }
    }

    fn strip_route(&self, url_path: &str) -> String {
        let mut path = if url_path.starts_with('/') {
            url_path.to_string()
        } else {
            format!("/{url_path}")
        };
        if let Some(rest) = path.strip_prefix(self.route.as_str()) {
            path = rest.to_string();
        }
        let slashed = format!("/{}", self.route);
        if let Some(rest) = path.strip_prefix(slashed.as_str()) {
            path = rest.to_string();
        }
        path
    }

    fn matches(&self, url_path: &str) -> bool {
        let key = self.route_key();
        if key.is_empty() {
            return true;
        }
        let path = url_path.trim_start_matches('/');
        match path.strip_prefix(key) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// 按词法折叠 `.`、`..` 与重复分隔符；顶层的 `..` 直接丢弃，结果总是后代路径。
pub fn clean_segments(path: &str) -> Vec<&str> {
    let mut stack = Vec::new();
    for segment in path.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    stack
}

/// 全部挂载点；查找时选择匹配的最长路由。
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<Arc<MountConfig>>,
}

impl MountTable {
    pub fn new(mounts: Vec<MountConfig>) -> Self {
        let mut mounts: Vec<Arc<MountConfig>> = mounts.into_iter().map(Arc::new).collect();
        mounts.sort_by(|a, b| b.route_key().len().cmp(&a.route_key().len()));
        Self { mounts }
    }

    pub fn find(&self, url_path: &str) -> Option<Arc<MountConfig>> {
        self.mounts
            .iter()
            .find(|mount| mount.matches(url_path))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MountConfig>> {
        self.mounts.iter()
    }
}
