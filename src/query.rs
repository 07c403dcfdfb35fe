use crate::grid::GridWindow;
use crate::registry::Product;

/// Variables are emitted in the product's declared order, not the caller's.
pub fn build_query(
    base_url: &str,
    product: &Product,
    variables: &[String],
    window: &GridWindow,
) -> String {
    let lon = format!("[{}:1:{}]", window.min_lon, window.max_lon);
    let lat = format!("[{}:1:{}]", window.min_lat, window.max_lat);

    let mut parts = product
        .variables()
        .iter()
        .filter(|declared| variables.iter().any(|requested| requested == *declared))
        .map(|name| format!("{name}[0:1:0]{lon}{lat}"))
        .collect::<Vec<_>>();
    parts.push(format!("lat{lat}"));
    parts.push(format!("lon{lon}"));
    parts.push("time[0:1:0]".to_string());

    format!("{}?{}", strip_query(base_url), parts.join(","))
}

pub fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BoundingBox;
    use crate::grid::GlobalGrid;
    use crate::registry::Registry;

    #[test]
    fn declared_order_wins() {
        let registry = Registry::builtin().unwrap();
        let product = registry.mission("gpm").unwrap().product("3IMERGHH").unwrap();
        let window = GlobalGrid::default()
            .to_indices(&BoundingBox::new(-33.0, 3.0, -72.0, -35.0).unwrap())
            .unwrap();
        let requested = vec![
            "randomError".to_string(),
            "precipitationCal".to_string(),
            "notAVariable".to_string(),
        ];

        let url = build_query("https://host/opendap/f.HDF5", product, &requested, &window);
        assert_eq!(
            url,
            "https://host/opendap/f.HDF5?precipitationCal[0:1:0][1079:1:1449][569:1:929],\
             randomError[0:1:0][1079:1:1449][569:1:929],\
             lat[569:1:929],lon[1079:1:1449],time[0:1:0]"
        );
    }
}
